use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;

use crate::crds::build::{BuildSpec, CaBundle};
use crate::crds::buildrun::BuildRunSpec;
use crate::crds::tekton::PodTemplate;

const DEFAULT_TOLERATION_EFFECT: &str = "NoSchedule";

/// BuildRun value when set, else the Build value.
fn pick<T: Clone>(buildrun: &Option<T>, build: &Option<T>) -> Option<T> {
    buildrun.clone().or_else(|| build.clone())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub fn effective_timeout(build: &BuildSpec, buildrun: &BuildRunSpec) -> Option<String> {
    non_empty(pick(&buildrun.timeout, &build.timeout))
}

pub fn effective_scheduler_name(build: &BuildSpec, buildrun: &BuildRunSpec) -> Option<String> {
    non_empty(pick(&buildrun.scheduler_name, &build.scheduler_name))
}

pub fn effective_runtime_class_name(build: &BuildSpec, buildrun: &BuildRunSpec) -> Option<String> {
    non_empty(pick(&buildrun.runtime_class_name, &build.runtime_class_name))
}

pub fn effective_ca_bundle(build: &BuildSpec, buildrun: &BuildRunSpec) -> Option<CaBundle> {
    pick(&buildrun.ca_bundle, &build.ca_bundle)
}

/// Output image reference: the BuildRun output replaces the Build output.
pub fn effective_output_image(build: &BuildSpec, buildrun: &BuildRunSpec) -> String {
    match &buildrun.output {
        Some(output) if !output.image.is_empty() => output.image.clone(),
        _ => build.output.image.clone(),
    }
}

pub fn effective_output_insecure(build: &BuildSpec, buildrun: &BuildRunSpec) -> bool {
    buildrun
        .output
        .as_ref()
        .and_then(|o| o.insecure)
        .or(build.output.insecure)
        .unwrap_or(false)
}

pub fn effective_push_secret(build: &BuildSpec, buildrun: &BuildRunSpec) -> Option<String> {
    let buildrun_output = buildrun.output.as_ref();
    non_empty(
        buildrun_output
            .and_then(|o| o.push_secret.clone())
            .or_else(|| build.output.push_secret.clone()),
    )
}

/// Union by key where `second` wins ties.
pub fn merge_maps(
    first: &BTreeMap<String, String>,
    second: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = first.clone();
    merged.extend(second.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// BuildRun tolerations first, then Build tolerations whose key is not taken yet.
pub fn merge_tolerations(build: &[Toleration], buildrun: &[Toleration]) -> Vec<Toleration> {
    let mut merged: Vec<Toleration> = Vec::with_capacity(build.len() + buildrun.len());

    for toleration in buildrun.iter().chain(build.iter()) {
        if merged.iter().any(|t| t.key == toleration.key) {
            continue;
        }
        let mut toleration = toleration.clone();
        if toleration.effect.as_deref().unwrap_or_default().is_empty() {
            toleration.effect = Some(DEFAULT_TOLERATION_EFFECT.to_string());
        }
        merged.push(toleration);
    }

    merged
}

pub fn pod_template(build: &BuildSpec, buildrun: &BuildRunSpec) -> PodTemplate {
    PodTemplate {
        node_selector: merge_maps(&build.node_selector, &buildrun.node_selector),
        tolerations: merge_tolerations(&build.tolerations, &buildrun.tolerations),
        scheduler_name: effective_scheduler_name(build, buildrun),
        runtime_class_name: effective_runtime_class_name(build, buildrun),
    }
}
