use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

/// Condition type every BuildRun and every job reports its lifecycle through.
pub const SUCCEEDED: &str = "Succeeded";

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn succeeded(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: SUCCEEDED.to_string(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ConditionStatus::Unknown
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Replaces the condition of the same type, or appends it.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Reads a Kubernetes `Time` through its RFC 3339 wire form.
pub fn time_to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(time).ok()?;
    let raw = raw.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn utc_to_time(time: DateTime<Utc>) -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(time.to_rfc3339())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_same_type() {
        let mut conditions = vec![Condition::succeeded(ConditionStatus::Unknown, "Pending", "")];
        set_condition(
            &mut conditions,
            Condition::succeeded(ConditionStatus::False, "Failed", "boom"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].message, "boom");
    }

    #[test]
    fn time_conversion_keeps_seconds() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let time = utc_to_time(now).unwrap();
        assert_eq!(time_to_utc(&time), Some(now));
    }

    #[test]
    fn condition_status_parses_wire_values() {
        let condition: Condition = serde_json::from_value(serde_json::json!({
            "type": "Succeeded",
            "status": "False",
            "reason": "Failed"
        }))
        .unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.is_terminal());
    }
}
