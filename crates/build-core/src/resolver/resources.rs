use std::collections::HashMap;

use k8s_openapi::api::core::v1::ResourceRequirements;

use crate::crds::build::BuildSpec;
use crate::crds::buildrun::BuildRunSpec;

/// Per-step resource overrides keyed by step name.
///
/// Precedence from lowest to highest: Build, the BuildRun's embedded Build spec,
/// then the BuildRun itself.
pub fn step_resource_overrides(
    build: &BuildSpec,
    buildrun: &BuildRunSpec,
) -> HashMap<String, ResourceRequirements> {
    let embedded = buildrun
        .build
        .spec
        .as_deref()
        .map(|spec| spec.step_resources.as_slice())
        .unwrap_or_default();

    build
        .step_resources
        .iter()
        .chain(embedded)
        .chain(buildrun.step_resources.iter())
        .map(|o| (o.name.clone(), o.resources.clone()))
        .collect()
}
