use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EnvVar, ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::labels;

pub const KIND_BUILD_STRATEGY: &str = "BuildStrategy";
pub const KIND_CLUSTER_BUILD_STRATEGY: &str = "ClusterBuildStrategy";

// -----------------------------------------------------------------------------
// BuildStrategy / ClusterBuildStrategy Resources
// -----------------------------------------------------------------------------
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "BuildStrategy",
    plural = "buildstrategies",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildStrategySpec {
    #[serde(flatten)]
    pub strategy: StrategySpec,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "ClusterBuildStrategy",
    plural = "clusterbuildstrategies",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBuildStrategySpec {
    #[serde(flatten)]
    pub strategy: StrategySpec,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<StrategySecurityContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<StrategyVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<StrategyCapabilities>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Array,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "type", default)]
    pub type_: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Vec<String>>,
}

impl Parameter {
    pub fn has_default(&self) -> bool {
        match self.type_ {
            ParameterType::String => self.default.is_some(),
            ParameterType::Array => self.defaults.is_some(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrategySecurityContext {
    pub run_as_user: i64,
    pub run_as_group: i64,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub volume: Volume,
}

impl StrategyVolume {
    pub fn is_overridable(&self) -> bool {
        self.overridable.unwrap_or(false)
    }
}

/// Behaviour a strategy declares instead of leaving the controller to infer it.
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyCapabilities {
    /// The strategy writes an OCI layout into `shp-output-directory` and relies on
    /// the output-processing step to push it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<bool>,
}

/// A namespaced or cluster-scoped strategy after lookup, with the metadata the
/// compiler propagates onto the job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedStrategy {
    pub kind: String,
    pub name: String,
    pub generation: i64,
    pub annotations: BTreeMap<String, String>,
    pub spec: StrategySpec,
}

impl ResolvedStrategy {
    pub fn resource_labels(&self) -> BTreeMap<String, String> {
        let (name_label, generation_label) = if self.kind == KIND_CLUSTER_BUILD_STRATEGY {
            (
                labels::CLUSTER_BUILD_STRATEGY_NAME,
                labels::CLUSTER_BUILD_STRATEGY_GENERATION,
            )
        } else {
            (
                labels::BUILD_STRATEGY_NAME,
                labels::BUILD_STRATEGY_GENERATION,
            )
        };

        BTreeMap::from([
            (name_label.to_string(), self.name.clone()),
            (generation_label.to_string(), self.generation.to_string()),
        ])
    }

    pub fn find_parameter(&self, name: &str) -> Option<&Parameter> {
        self.spec.parameters.iter().find(|p| p.name == name)
    }
}

impl From<BuildStrategy> for ResolvedStrategy {
    fn from(value: BuildStrategy) -> Self {
        Self {
            kind: KIND_BUILD_STRATEGY.to_string(),
            name: value.name_any(),
            generation: value.metadata.generation.unwrap_or_default(),
            annotations: value.metadata.annotations.clone().unwrap_or_default(),
            spec: value.spec.strategy,
        }
    }
}

impl From<ClusterBuildStrategy> for ResolvedStrategy {
    fn from(value: ClusterBuildStrategy) -> Self {
        Self {
            kind: KIND_CLUSTER_BUILD_STRATEGY.to_string(),
            name: value.name_any(),
            generation: value.metadata.generation.unwrap_or_default(),
            annotations: value.metadata.annotations.clone().unwrap_or_default(),
            spec: value.spec.strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_strategy_labels_use_cluster_domain() {
        let mut strategy = ClusterBuildStrategy::new(
            "buildkit",
            ClusterBuildStrategySpec::default(),
        );
        strategy.metadata.generation = Some(3);

        let resolved = ResolvedStrategy::from(strategy);
        let labels = resolved.resource_labels();

        assert_eq!(
            labels.get(labels::CLUSTER_BUILD_STRATEGY_NAME).map(String::as_str),
            Some("buildkit")
        );
        assert_eq!(
            labels
                .get(labels::CLUSTER_BUILD_STRATEGY_GENERATION)
                .map(String::as_str),
            Some("3")
        );
    }

    #[test]
    fn strategy_volume_keeps_flattened_source() {
        let volume: StrategyVolume = serde_json::from_value(serde_json::json!({
            "name": "cache",
            "overridable": true,
            "emptyDir": {}
        }))
        .unwrap();
        assert!(volume.is_overridable());
        assert_eq!(volume.volume.name, "cache");
        assert!(volume.volume.empty_dir.is_some());
    }
}
