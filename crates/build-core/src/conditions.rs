use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};

use crate::crds::buildrun::{BUILD_RUN_STATE_CANCEL, BuildRun, FailureDetails, Location};
use crate::crds::common::{Condition, ConditionStatus, SUCCEEDED};
use crate::crds::tekton::{PipelineRun, TaskRun};

// BuildRun failure reasons
pub const UNKNOWN_STRATEGY_KIND: &str = "UnknownStrategyKind";
pub const CLUSTER_BUILD_STRATEGY_NOT_FOUND: &str = "ClusterBuildStrategyNotFound";
pub const BUILD_STRATEGY_NOT_FOUND: &str = "BuildStrategyNotFound";
pub const SET_OWNER_REFERENCE_FAILED: &str = "SetOwnerReferenceFailed";
pub const FAILED: &str = "Failed";
pub const TASK_RUN_IS_MISSING: &str = "TaskRunIsMissing";
pub const TASK_RUN_GENERATION_FAILED: &str = "TaskRunGenerationFailed";
pub const PIPELINE_RUN_GENERATION_FAILED: &str = "PipelineRunGenerationFailed";
pub const SERVICE_ACCOUNT_NOT_FOUND: &str = "ServiceAccountNotFound";
pub const BUILD_REGISTRATION_FAILED: &str = "BuildRegistrationFailed";
pub const BUILD_NOT_FOUND: &str = "BuildNotFound";
pub const MISSING_PARAMETER_VALUES: &str = "MissingParameterValues";
pub const RESTRICTED_PARAMETERS_IN_USE: &str = "RestrictedParametersInUse";
pub const UNDEFINED_PARAMETER: &str = "UndefinedParameter";
pub const WRONG_PARAMETER_VALUE_TYPE: &str = "WrongParameterValueType";
pub const INCONSISTENT_PARAMETER_VALUES: &str = "InconsistentParameterValues";
pub const EMPTY_ARRAY_ITEM_PARAMETER_VALUES: &str = "EmptyArrayItemParameterValues";
pub const INCOMPLETE_CONFIG_MAP_VALUE_PARAMETER_VALUES: &str =
    "IncompleteConfigMapValueParameterValues";
pub const INCOMPLETE_SECRET_VALUE_PARAMETER_VALUES: &str = "IncompleteSecretValueParameterValues";
pub const BUILD_RUN_NAME_INVALID: &str = "BuildRunNameInvalid";
pub const BUILD_RUN_NO_REF_OR_SPEC: &str = "BuildRunNoRefOrSpec";
pub const BUILD_RUN_AMBIGUOUS_BUILD: &str = "BuildRunAmbiguousBuild";
pub const BUILD_RUN_BUILD_FIELD_OVERRIDE_FORBIDDEN: &str = "BuildRunBuildFieldOverrideForbidden";
pub const UNDEFINED_STEP_RESOURCE: &str = "UndefinedStepResource";
pub const RUNTIME_CLASS_NAME_NOT_VALID: &str = "RuntimeClassNameNotValid";
pub const VOLUME_NOT_OVERRIDABLE: &str = "VolumeNotOverridable";
pub const UNDEFINED_VOLUME: &str = "UndefinedVolume";
pub const OUTPUT_TIMESTAMP_NOT_VALID: &str = "OutputTimestampNotValid";

// Job driven reasons
pub const POD_EVICTED: &str = "PodEvicted";
pub const STEP_OUT_OF_MEMORY: &str = "StepOutOfMemory";
pub const VULNERABILITIES_FOUND: &str = "VulnerabilitiesFound";
pub const BUILD_RUN_TIMEOUT: &str = "BuildRunTimeout";
pub const PIPELINE_RUN_FAILED: &str = "PipelineRunFailed";

// Reasons the job backends report
pub const TASK_RUN_REASON_STARTED: &str = "Started";
pub const TASK_RUN_REASON_RUNNING: &str = "Running";
pub const TASK_RUN_REASON_CANCELLED: &str = "TaskRunCancelled";
pub const TASK_RUN_REASON_TIMED_OUT: &str = "TaskRunTimeout";
pub const TASK_RUN_REASON_SUCCESSFUL: &str = "Succeeded";
pub const TASK_RUN_REASON_FAILED: &str = "Failed";
pub const PIPELINE_RUN_REASON_TIMED_OUT: &str = "PipelineRunTimeout";
pub const PIPELINE_RUN_REASON_CANCELLED: &str = "PipelineRunCancelled";

const IMAGE_PROCESSING_CONTAINER: &str = "step-image-processing";
const VULNERABILITIES_EXIT_CODE: i32 = 22;

/// A BuildRun's condition after a terminal decision the reconciler made itself.
pub fn failed(reason: &str, message: impl Into<String>) -> Condition {
    Condition::succeeded(ConditionStatus::False, reason, message)
}

/// First container of the pod whose status reports a non-zero exit.
pub fn failed_container(pod: &Pod) -> Option<(&Container, Option<&ContainerStatus>)> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let failed: Vec<&ContainerStatus> = statuses
        .iter()
        .filter(|status| {
            status
                .state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .is_some_and(|t| t.exit_code != 0)
        })
        .collect();

    pod.spec.as_ref()?.containers.iter().find_map(|container| {
        failed
            .iter()
            .find(|status| status.name == container.name)
            .map(|status| (container, Some(*status)))
    })
}

/// Outcome of inspecting the pod behind a failed single-phase job.
struct PodFailure {
    reason: Option<&'static str>,
    message: String,
    location: Location,
}

fn inspect_failed_pod(pod: &Pod, run_label: Option<&str>) -> PodFailure {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let pod_status = pod.status.as_ref();
    let mut location = Location {
        pod: pod_name.clone(),
        container: String::new(),
    };

    let failed = failed_container(pod);

    if pod_status.and_then(|s| s.reason.as_deref()) == Some("Evicted") {
        if let Some((container, _)) = failed {
            location.container = container.name.clone();
        }
        return PodFailure {
            reason: Some(POD_EVICTED),
            message: pod_status
                .and_then(|s| s.message.clone())
                .unwrap_or_default(),
            location,
        };
    }

    let Some((container, status)) = failed else {
        let message = match run_label {
            Some(run) => format!(
                "PipelineRun {run} failed due to an unexpected error in pod {pod_name}: for detailed information: kubectl --namespace {namespace} logs {pod_name} --all-containers"
            ),
            None => format!(
                "buildrun failed due to an unexpected error in pod {pod_name}: for detailed information: kubectl --namespace {namespace} logs {pod_name} --all-containers"
            ),
        };
        return PodFailure {
            reason: None,
            message,
            location,
        };
    };

    let container_name = container.name.clone();
    location.container = container_name.clone();
    let logs_hint = format!(
        "kubectl --namespace {namespace} logs {pod_name} --container={container_name}"
    );

    let terminated = status
        .and_then(|s| s.state.as_ref())
        .and_then(|s| s.terminated.as_ref());

    let (reason, message) = match terminated {
        Some(t) if t.reason.as_deref() == Some("OOMKilled") => (
            Some(STEP_OUT_OF_MEMORY),
            match run_label {
                Some(run) => format!(
                    "PipelineRun {run} failed due to out-of-memory in step {container_name}, for detailed information: {logs_hint}"
                ),
                None => format!(
                    "buildrun step {container_name} failed due to out-of-memory, for detailed information: {logs_hint}"
                ),
            },
        ),
        Some(t)
            if container_name == IMAGE_PROCESSING_CONTAINER
                && t.exit_code == VULNERABILITIES_EXIT_CODE =>
        {
            (
                Some(VULNERABILITIES_FOUND),
                match run_label {
                    Some(run) => format!(
                        "Vulnerabilities have been found in the image from PipelineRun {run}, for detailed information: {logs_hint}"
                    ),
                    None => format!(
                        "Vulnerabilities have been found in the image which can be seen in the buildrun status. For detailed information,see {logs_hint}"
                    ),
                },
            )
        }
        _ => (
            None,
            match run_label {
                Some(run) => format!(
                    "PipelineRun {run} failed in step {container_name}, for detailed information: {logs_hint}"
                ),
                None => format!(
                    "buildrun step {container_name} failed, for detailed information: {logs_hint}"
                ),
            },
        ),
    };

    PodFailure {
        reason,
        message,
        location,
    }
}

/// Go-style rendering of a whole number of seconds, `1h2m3s`.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    match (hours, minutes) {
        (0, 0) => format!("{secs}s"),
        (0, _) => format!("{minutes}m{secs}s"),
        _ => format!("{hours}h{minutes}m{secs}s"),
    }
}

fn elapsed_since(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    created
        .map(|created| format_duration((now - created).num_seconds()))
        .unwrap_or_else(|| format_duration(0))
}

fn creation_time(meta: &kube::api::ObjectMeta) -> Option<DateTime<Utc>> {
    meta.creation_timestamp
        .as_ref()
        .and_then(crate::crds::common::time_to_utc)
}

/// Whether mapping this TaskRun condition needs the pod behind the TaskRun.
pub fn needs_pod(task_run: &TaskRun, condition: &Condition) -> bool {
    condition.reason == TASK_RUN_REASON_FAILED
        && task_run
            .status
            .as_ref()
            .is_some_and(|s| s.completion_time.is_some())
}

/// Maps the `Succeeded` condition of a TaskRun onto the BuildRun.
///
/// `pod` is only consulted for a completed failure; `None` there means the
/// pod could not be found.
pub fn from_task_run(
    buildrun: &BuildRun,
    task_run: &TaskRun,
    condition: &Condition,
    pod: Option<&Pod>,
) -> Condition {
    let mut status = condition.status;
    let mut reason = condition.reason.clone();
    let mut message = condition.message.clone();

    match condition.reason.as_str() {
        TASK_RUN_REASON_STARTED | TASK_RUN_REASON_RUNNING if buildrun.is_canceled() => {
            status = ConditionStatus::Unknown;
            reason = BUILD_RUN_STATE_CANCEL.to_string();
            message = "The user requested the BuildRun to be canceled.  This BuildRun controller has requested the TaskRun be canceled.  That request has not been process by Tekton's TaskRun controller yet.".to_string();
        }
        TASK_RUN_REASON_CANCELLED if buildrun.is_canceled() => {
            status = ConditionStatus::False;
            reason = BUILD_RUN_STATE_CANCEL.to_string();
            message = "The BuildRun and underlying TaskRun were canceled successfully.".to_string();
        }
        TASK_RUN_REASON_TIMED_OUT => {
            reason = BUILD_RUN_TIMEOUT.to_string();
            let timeout = task_run
                .spec
                .timeout
                .clone()
                .unwrap_or_else(|| elapsed_since(creation_time(&task_run.metadata), Utc::now()));
            message = format!(
                "BuildRun {} failed to finish within {timeout}",
                buildrun.metadata.name.as_deref().unwrap_or_default()
            );
        }
        TASK_RUN_REASON_SUCCESSFUL if buildrun.is_canceled() => {
            message = "The TaskRun completed before the request to cancel the TaskRun could be processed.".to_string();
        }
        TASK_RUN_REASON_FAILED if needs_pod(task_run, condition) => match pod {
            None => {
                message = format!(
                    "buildrun failed, pod {}/{} not found",
                    task_run.metadata.namespace.as_deref().unwrap_or_default(),
                    task_run
                        .status
                        .as_ref()
                        .and_then(|s| s.pod_name.as_deref())
                        .unwrap_or_default()
                );
            }
            Some(pod) => {
                let failure = inspect_failed_pod(pod, None);
                if let Some(r) = failure.reason {
                    reason = r.to_string();
                }
                message = failure.message;
            }
        },
        _ => {}
    }

    Condition {
        type_: SUCCEEDED.to_string(),
        status,
        last_transition_time: Some(Utc::now()),
        reason,
        message,
    }
}

/// A child TaskRun of a PipelineRun together with its pod, if it still exists.
pub struct ChildRun<'a> {
    pub task_run: &'a TaskRun,
    pub pod: Option<&'a Pod>,
}

/// Maps the `Succeeded` condition of a PipelineRun onto the BuildRun, returning
/// the failure location found among the child TaskRuns.
pub fn from_pipeline_run(
    buildrun: &BuildRun,
    pipeline_run: &PipelineRun,
    condition: &Condition,
    children: &[ChildRun<'_>],
) -> (Condition, Option<FailureDetails>) {
    let mut status = condition.status;
    let mut reason = condition.reason.clone();
    let mut message = condition.message.clone();
    let mut details = None;
    let run_name = pipeline_run.metadata.name.clone().unwrap_or_default();

    match condition.reason.as_str() {
        TASK_RUN_REASON_STARTED | TASK_RUN_REASON_RUNNING if buildrun.is_canceled() => {
            status = ConditionStatus::Unknown;
            reason = BUILD_RUN_STATE_CANCEL.to_string();
            message = "The user requested the BuildRun to be canceled.  This BuildRun controller has requested the PipelineRun be canceled.  That request has not been process by Tekton's PipelineRun controller yet.".to_string();
        }
        PIPELINE_RUN_REASON_TIMED_OUT => {
            reason = BUILD_RUN_TIMEOUT.to_string();
            let timeout = pipeline_run
                .spec
                .timeouts
                .as_ref()
                .and_then(|t| t.pipeline.clone())
                .unwrap_or_else(|| {
                    elapsed_since(creation_time(&pipeline_run.metadata), Utc::now())
                });
            message = format!(
                "BuildRun {} failed to finish within {timeout}",
                buildrun.metadata.name.as_deref().unwrap_or_default()
            );
        }
        PIPELINE_RUN_REASON_CANCELLED if buildrun.is_canceled() => {
            status = ConditionStatus::False;
            reason = BUILD_RUN_STATE_CANCEL.to_string();
            message =
                "The BuildRun and underlying PipelineRun were canceled successfully.".to_string();
        }
        TASK_RUN_REASON_SUCCESSFUL if buildrun.is_canceled() => {
            message = "The PipelineRun completed before the request to cancel the PipelineRun could be processed.".to_string();
        }
        TASK_RUN_REASON_FAILED
            if pipeline_run
                .status
                .as_ref()
                .is_some_and(|s| s.completion_time.is_some()) =>
        {
            let (r, m, d) = pipeline_failure(&run_name, pipeline_run, children);
            reason = r;
            message = m;
            details = d;
        }
        _ => {}
    }

    let condition = Condition {
        type_: SUCCEEDED.to_string(),
        status,
        last_transition_time: Some(Utc::now()),
        reason,
        message,
    };
    (condition, details)
}

fn pipeline_failure(
    run_name: &str,
    pipeline_run: &PipelineRun,
    children: &[ChildRun<'_>],
) -> (String, String, Option<FailureDetails>) {
    let has_children = pipeline_run
        .status
        .as_ref()
        .is_some_and(|s| !s.child_references.is_empty());
    if !has_children {
        return (
            PIPELINE_RUN_FAILED.to_string(),
            format!("PipelineRun {run_name} failed with no child TaskRuns"),
            None,
        );
    }

    for child in children {
        let failed = child
            .task_run
            .status
            .as_ref()
            .and_then(|s| crate::crds::common::find_condition(&s.conditions, SUCCEEDED))
            .is_some_and(|c| c.status == ConditionStatus::False);
        if !failed {
            continue;
        }

        let Some(pod) = child.pod else {
            return (
                PIPELINE_RUN_FAILED.to_string(),
                format!(
                    "PipelineRun {run_name} failed, pod {}/{} not found",
                    child.task_run.metadata.namespace.as_deref().unwrap_or_default(),
                    child
                        .task_run
                        .status
                        .as_ref()
                        .and_then(|s| s.pod_name.as_deref())
                        .unwrap_or_default()
                ),
                None,
            );
        };

        let failure = inspect_failed_pod(pod, Some(run_name));
        return (
            failure.reason.unwrap_or(PIPELINE_RUN_FAILED).to_string(),
            failure.message,
            Some(FailureDetails {
                reason: None,
                message: None,
                location: Some(failure.location),
            }),
        );
    }

    (
        PIPELINE_RUN_FAILED.to_string(),
        format!("PipelineRun {run_name} failed"),
        None,
    )
}
