use serde::de::DeserializeOwned;

/// Parses a configuration value that may arrive as JSON or as a loose
/// environment string.
pub fn parse_value<T>(raw: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<T>(raw) {
        return Some(v);
    }
    // A broken object must not come back as a one-element sequence
    if raw.starts_with('{') {
        return None;
    }

    // PROMETHEUS_BR_COMP_DUR_BUCKETS=50,100,150 -> [50,100,150]
    // PROMETHEUS_ENABLED_LABELS=namespace -> ["namespace"]
    let items: Vec<&str> = raw.split(',').map(str::trim).collect();

    let bare = format!("[{}]", items.join(","));
    if let Ok(v) = serde_json::from_str::<T>(&bare) {
        return Some(v);
    }

    let quoted = format!(
        "[{}]",
        items
            .iter()
            .map(|s| serde_json::Value::String(s.to_string()).to_string())
            .collect::<Vec<String>>()
            .join(",")
    );
    if let Ok(v) = serde_json::from_str::<T>(&quoted) {
        return Some(v);
    }

    // A bare word only deserializes into a String once quoted
    let quoted = serde_json::Value::String(raw.to_string()).to_string();
    serde_json::from_str::<T>(&quoted).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Template {
        image: String,
    }

    #[test]
    fn csv_numbers_and_words() {
        assert_eq!(parse_value::<Vec<f64>>("0, 1, 10.5"), Some(vec![0.0, 1.0, 10.5]));
        assert_eq!(
            parse_value::<Vec<String>>("namespace,strategy"),
            Some(vec!["namespace".to_string(), "strategy".to_string()])
        );
        assert_eq!(parse_value::<Vec<f64>>("5"), Some(vec![5.0]));
        assert_eq!(
            parse_value::<Vec<String>>("buildrun"),
            Some(vec!["buildrun".to_string()])
        );
    }

    #[test]
    fn json_wins_over_fallbacks() {
        assert_eq!(
            parse_value::<Template>(r#"{"image":"ghcr.io/shipwright-io/build/git:latest"}"#),
            Some(Template {
                image: "ghcr.io/shipwright-io/build/git:latest".to_string()
            })
        );
        assert_eq!(parse_value::<u32>("42"), Some(42));
        assert_eq!(parse_value::<String>("tekton"), Some("tekton".to_string()));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_value::<u32>("many"), None);
        assert_eq!(parse_value::<Vec<f64>>(""), None);
        assert_eq!(parse_value::<Template>("{not json"), None);
    }
}
