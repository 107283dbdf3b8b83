use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, Toleration};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::crds::build::{
    BuildRetention, BuildSpec, BuildVolume, CaBundle, Image, ParamValue, StepResourceOverride,
};
use crate::crds::common::{Condition, SUCCEEDED, find_condition};

/// Requested state a user sets to cancel a running BuildRun.
pub const BUILD_RUN_STATE_CANCEL: &str = "BuildRunCanceled";

// -----------------------------------------------------------------------------
// BuildRun Resource (one attempt of a Build)
// -----------------------------------------------------------------------------
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "BuildRun",
    plural = "buildruns",
    namespaced,
    schema = "disabled",
    status = "BuildRunStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunSpec {
    #[serde(default)]
    pub build: ReferencedBuild,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<BuildRunServiceAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_values: Vec<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<BuildRetention>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<BuildVolume>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_resources: Vec<StepResourceOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<CaBundle>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Box<BuildSpec>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunServiceAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<BuildExecutor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_spec: Option<BuildSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_details: Option<FailureDetails>,
}

/// Reference to the latest job instance created for a BuildRun.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildExecutor {
    pub name: String,
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_artifact: Option<OciArtifactSourceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSourceResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciArtifactSourceResult {
    pub digest: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<Vulnerability>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    pub severity: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
}

impl BuildRunSpec {
    pub fn is_canceled(&self) -> bool {
        self.state.as_deref() == Some(BUILD_RUN_STATE_CANCEL)
    }

    pub fn generates_service_account(&self) -> bool {
        self.service_account
            .as_ref()
            .and_then(|sa| sa.generate)
            .unwrap_or(false)
    }

    pub fn service_account_name(&self) -> Option<&str> {
        self.service_account.as_ref().and_then(|sa| sa.name.as_deref())
    }
}

impl BuildRun {
    pub fn is_canceled(&self) -> bool {
        self.spec.is_canceled()
    }

    pub fn status_ref(&self) -> Option<&BuildRunStatus> {
        self.status.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.status_ref()
            .and_then(|s| s.completion_time)
            .is_some()
    }

    pub fn succeeded_condition(&self) -> Option<&Condition> {
        self.status_ref()
            .and_then(|s| find_condition(&s.conditions, SUCCEEDED))
    }

    pub fn executor_name(&self) -> Option<&str> {
        self.status_ref()
            .and_then(|s| s.executor.as_ref())
            .map(|e| e.name.as_str())
    }

    /// Name of the referenced Build, empty for an embedded spec.
    pub fn build_name(&self) -> &str {
        self.spec.build.name.as_deref().unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut BuildRunStatus {
        self.status.get_or_insert_with(BuildRunStatus::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_state_is_detected() {
        let mut buildrun = BuildRun::new("run", BuildRunSpec::default());
        assert!(!buildrun.is_canceled());

        buildrun.spec.state = Some(BUILD_RUN_STATE_CANCEL.to_string());
        assert!(buildrun.is_canceled());
    }

    #[test]
    fn status_mut_initializes_empty_status() {
        let mut buildrun = BuildRun::new("run", BuildRunSpec::default());
        assert!(!buildrun.is_done());

        buildrun.status_mut().completion_time = Some(Utc::now());
        assert!(buildrun.is_done());
    }

    #[test]
    fn embedded_build_spec_decodes() {
        let spec: BuildRunSpec = serde_json::from_value(serde_json::json!({
            "build": {
                "spec": {
                    "strategy": { "name": "kaniko" },
                    "output": { "image": "registry/ns/img:latest" }
                }
            },
            "serviceAccount": { "generate": true }
        }))
        .unwrap();

        assert!(spec.build.name.is_none());
        assert_eq!(
            spec.build.spec.as_ref().map(|s| s.output.image.as_str()),
            Some("registry/ns/img:latest")
        );
        assert!(spec.generates_service_account());
    }
}
