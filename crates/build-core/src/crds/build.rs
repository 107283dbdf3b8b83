use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Toleration, Volume};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::crds::common::ConditionStatus;

// -----------------------------------------------------------------------------
// Build Resource (reusable template a BuildRun instantiates)
// -----------------------------------------------------------------------------
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "Build",
    plural = "builds",
    namespaced,
    schema = "disabled",
    status = "BuildStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub strategy: StrategyRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_values: Vec<ParamValue>,
    #[serde(default)]
    pub output: Image,
    /// Go-style duration string, passed through to the job untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
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
pub struct BuildStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<ConditionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BuildSpec {
    pub fn strategy_name(&self) -> &str {
        &self.strategy.name
    }
}

impl Build {
    pub fn is_registered(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.registered),
            Some(ConditionStatus::True)
        )
    }
}

// -----------------------------------------------------------------------------
// Shared Sub-Types
// -----------------------------------------------------------------------------
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRef {
    pub name: String,
    /// `BuildStrategy` (default) or `ClusterBuildStrategy`. Kept as a string so an
    /// unknown kind surfaces as a BuildRun failure instead of a decode error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum SourceType {
    #[default]
    Git,
    #[serde(rename = "OCI")]
    Oci,
    Local,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(rename = "type", default)]
    pub type_: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<Git>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_artifact: Option<OciArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Git {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum PruneOption {
    #[default]
    Never,
    AfterPull,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciArtifact {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<PruneOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Local {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_secret: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerability_scan: Option<VulnerabilityScanOptions>,
    /// `Zero`, `SourceTimestamp`, `BuildTimestamp` or seconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityScanOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub fail_on_finding: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<VulnerabilityIgnoreOptions>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityIgnoreOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfixed: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKeyRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SingleValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_value: Option<ObjectKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_value: Option<ObjectKeyRef>,
}

impl SingleValue {
    pub fn is_set(&self) -> bool {
        self.value.is_some() || self.config_map_value.is_some() || self.secret_value.is_some()
    }

    pub fn set_count(&self) -> usize {
        [
            self.value.is_some(),
            self.config_map_value.is_some(),
            self.secret_value.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParamValue {
    pub name: String,
    #[serde(flatten)]
    pub single: SingleValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<SingleValue>>,
}

impl ParamValue {
    pub fn literal(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            single: SingleValue {
                value: Some(value.to_string()),
                ..Default::default()
            },
            values: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub volume: Volume,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRetention {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_after_failed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_after_succeeded: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResourceOverride {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<KeyRef>,
}
