use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::compiler::{
    CompileInput, PARAM_OUTPUT_DIRECTORY, PARAM_OUTPUT_IMAGE, PARAM_OUTPUT_INSECURE,
    PARAM_SOURCE_CONTEXT, PARAM_SOURCE_ROOT, RESULT_ERROR_MESSAGE, RESULT_ERROR_REASON,
    RESULT_IMAGE_DIGEST, RESULT_IMAGE_SIZE, RESULT_IMAGE_VULNERABILITIES, SOURCE_ROOT,
    StageError, WORKSPACE_SOURCE,
};
use crate::crds::build::{Build, BuildSpec};
use crate::crds::buildrun::{BuildRun, BuildRunSpec};
use crate::crds::strategy::{Parameter, ParameterType, Step};
use crate::crds::tekton::{
    PARAM_TYPE_ARRAY, PARAM_TYPE_STRING, Param, ParamSpec, ParamValue, TaskResult, TaskSpec,
    TaskStep, WorkspaceDeclaration,
};
use crate::labels;
use crate::resolver::{
    effective_output_image, effective_output_insecure, merge_env_vars, resolve_volumes,
    step_resource_overrides,
};

fn string_param_spec(name: &str, description: &str) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        description: description.to_string(),
        type_: Some(PARAM_TYPE_STRING.to_string()),
        default: None,
    }
}

fn result(name: &str, description: &str) -> TaskResult {
    TaskResult {
        name: name.to_string(),
        description: description.to_string(),
    }
}

/// Task spec every phase starts from: system params, the source workspace
/// and the output and error results.
pub(crate) fn base_task_spec() -> TaskSpec {
    TaskSpec {
        params: base_param_specs(),
        workspaces: vec![WorkspaceDeclaration {
            name: WORKSPACE_SOURCE.to_string(),
            description: String::new(),
        }],
        results: vec![
            result(RESULT_IMAGE_DIGEST, "The digest of the image"),
            result(RESULT_IMAGE_SIZE, "The compressed size of the image"),
            result(RESULT_IMAGE_VULNERABILITIES, "List of vulnerabilities"),
            result(RESULT_ERROR_MESSAGE, "The error description of the task run"),
            result(RESULT_ERROR_REASON, "The error reason of the task run"),
        ],
        ..Default::default()
    }
}

pub(crate) fn base_param_specs() -> Vec<ParamSpec> {
    vec![
        string_param_spec(
            PARAM_OUTPUT_IMAGE,
            "The URL of the image that the build produces",
        ),
        string_param_spec(
            PARAM_OUTPUT_INSECURE,
            "A flag indicating that the output image is on an insecure container registry",
        ),
        string_param_spec(
            PARAM_SOURCE_CONTEXT,
            "The context directory inside the source directory",
        ),
        string_param_spec(PARAM_SOURCE_ROOT, "The source directory"),
    ]
}

pub(crate) fn output_directory_param_spec() -> ParamSpec {
    ParamSpec {
        name: PARAM_OUTPUT_DIRECTORY.to_string(),
        description: String::new(),
        type_: Some(PARAM_TYPE_STRING.to_string()),
        default: None,
    }
}

pub(crate) fn param_reference(name: &str) -> Param {
    Param::string(name, format!("$(params.{name})"))
}

/// Forwards the system params of a pipeline into one of its tasks.
pub(crate) fn base_param_references() -> Vec<Param> {
    [
        PARAM_OUTPUT_IMAGE,
        PARAM_OUTPUT_INSECURE,
        PARAM_SOURCE_ROOT,
        PARAM_SOURCE_CONTEXT,
    ]
    .into_iter()
    .map(param_reference)
    .collect()
}

pub(crate) fn source_context(build: &BuildSpec) -> String {
    match build
        .source
        .as_ref()
        .and_then(|s| s.context_dir.as_deref())
        .map(|dir| dir.trim_matches('/'))
    {
        Some(dir) if !dir.is_empty() => format!("{SOURCE_ROOT}/{dir}"),
        _ => SOURCE_ROOT.to_string(),
    }
}

/// Values for the system params.
pub(crate) fn base_param_values(build: &BuildSpec, buildrun: &BuildRunSpec) -> Vec<Param> {
    vec![
        Param::string(PARAM_OUTPUT_IMAGE, effective_output_image(build, buildrun)),
        Param::string(
            PARAM_OUTPUT_INSECURE,
            effective_output_insecure(build, buildrun).to_string(),
        ),
        Param::string(PARAM_SOURCE_ROOT, SOURCE_ROOT),
        Param::string(PARAM_SOURCE_CONTEXT, source_context(build)),
    ]
}

/// Ownership labels. They double as the idempotency key when looking for a
/// job created by an interrupted reconcile.
pub(crate) fn job_labels(build: &Build, buildrun: &BuildRun) -> BTreeMap<String, String> {
    let mut job_labels = BTreeMap::from([
        (labels::BUILD_RUN_NAME.to_string(), buildrun.name_any()),
        (
            labels::BUILD_RUN_GENERATION.to_string(),
            buildrun.metadata.generation.unwrap_or_default().to_string(),
        ),
    ]);

    let build_name = build.name_any();
    if !build_name.is_empty() {
        job_labels.insert(labels::BUILD_NAME.to_string(), build_name);
        job_labels.insert(
            labels::BUILD_GENERATION.to_string(),
            build.metadata.generation.unwrap_or_default().to_string(),
        );
    }

    job_labels
}

pub(crate) fn job_metadata(build: &Build, buildrun: &BuildRun) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(format!("{}-", buildrun.name_any())),
        namespace: buildrun.metadata.namespace.clone(),
        labels: Some(job_labels(build, buildrun)),
        ..Default::default()
    }
}

/// Strategy parameters as task or pipeline parameter declarations.
pub(crate) fn strategy_param_specs(parameters: &[Parameter]) -> Vec<ParamSpec> {
    parameters
        .iter()
        .map(|parameter| {
            let (type_, default) = match parameter.type_ {
                ParameterType::String => (
                    PARAM_TYPE_STRING,
                    parameter.default.clone().map(ParamValue::String),
                ),
                ParameterType::Array => (
                    PARAM_TYPE_ARRAY,
                    parameter.defaults.clone().map(ParamValue::Array),
                ),
            };
            ParamSpec {
                name: parameter.name.clone(),
                description: parameter.description.clone(),
                type_: Some(type_.to_string()),
                default,
            }
        })
        .collect()
}

/// The strategy steps as task steps, carrying the combined env and any
/// resource override, plus every volume mount they declare.
pub(crate) fn strategy_steps(
    input: &CompileInput<'_>,
    combined_env: &[EnvVar],
) -> Result<(Vec<TaskStep>, Vec<VolumeMount>), StageError> {
    let overrides = step_resource_overrides(&input.build.spec, &input.buildrun.spec);
    let mut steps = Vec::with_capacity(input.strategy.spec.steps.len());
    let mut mounts = Vec::new();

    for step in &input.strategy.spec.steps {
        let env = merge_env_vars(combined_env, &step.env, false).map_err(|source| {
            StageError::StepEnv {
                strategy: input.build.spec.strategy_name().to_string(),
                source,
            }
        })?;

        steps.push(TaskStep {
            name: step.name.clone(),
            image: step.image.clone(),
            image_pull_policy: step.image_pull_policy.clone(),
            command: step.command.clone(),
            args: step.args.clone(),
            working_dir: step.working_dir.clone(),
            env,
            compute_resources: overrides
                .get(&step.name)
                .cloned()
                .or_else(|| step.resources.clone()),
            volume_mounts: step.volume_mounts.clone(),
            security_context: step.security_context.clone(),
        });
        mounts.extend(step.volume_mounts.iter().cloned());
    }

    Ok((steps, mounts))
}

pub(crate) fn strategy_volumes(
    input: &CompileInput<'_>,
    mounts: &[VolumeMount],
) -> Result<Vec<Volume>, StageError> {
    Ok(resolve_volumes(
        mounts,
        &input.strategy.spec.volumes,
        &input.build.spec.volumes,
        &input.buildrun.spec.volumes,
    )?)
}

fn contains_reference(value: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| value.contains(needle.as_str()))
}

/// Whether the step mentions `$(params.<name>` in any of its textual forms.
pub(crate) fn references_param(step: &TaskStep, name: &str) -> bool {
    let needles = [
        format!("$(params.{name}"),
        format!("$(params['{name}']"),
        format!("$(params[\"{name}\"]"),
    ];

    step.command.iter().any(|c| contains_reference(c, &needles))
        || step.args.iter().any(|a| contains_reference(a, &needles))
        || step
            .env
            .iter()
            .filter_map(|e| e.value.as_deref())
            .any(|v| contains_reference(v, &needles))
}

/// A declared capability wins; otherwise the strategy is taken to use the
/// output directory when one of its steps references the parameter.
pub(crate) fn uses_output_directory(input: &CompileInput<'_>, steps: &[TaskStep]) -> bool {
    match input
        .strategy
        .spec
        .capabilities
        .and_then(|c| c.output_directory)
    {
        Some(declared) => declared,
        None => steps
            .iter()
            .any(|step| references_param(step, PARAM_OUTPUT_DIRECTORY)),
    }
}

/// Strategy steps that get the output directory mounted: the ones referencing
/// it, or all of them when the capability is declared without a reference.
pub(crate) fn output_directory_consumers<'s>(
    steps: &'s mut [TaskStep],
    strategy_steps: &[Step],
) -> Vec<&'s mut TaskStep> {
    let referencing = steps
        .iter()
        .any(|step| references_param(step, PARAM_OUTPUT_DIRECTORY));

    steps
        .iter_mut()
        .filter(|step| {
            if referencing {
                references_param(step, PARAM_OUTPUT_DIRECTORY)
            } else {
                strategy_steps.iter().any(|s| s.name == step.name)
            }
        })
        .collect()
}
