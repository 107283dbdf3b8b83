use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use tracing::warn;

use crate::compiler::{RESULT_ERROR_MESSAGE, RESULT_ERROR_REASON};
use crate::conditions::{ChildRun, failed_container};
use crate::crds::buildrun::{FailureDetails, Location};
use crate::crds::common::{ConditionStatus, SUCCEEDED, find_condition, time_to_utc};
use crate::crds::tekton::TaskRun;

/// Entry of the JSON array a step writes to its termination message.
#[derive(Deserialize)]
struct TerminationResult {
    key: String,
    #[serde(default)]
    value: String,
}

fn error_results(message: &str) -> Option<(Option<String>, Option<String>)> {
    let entries: Vec<TerminationResult> = match serde_json::from_str(message) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "⚠️ Step termination message is not a result list");
            return None;
        }
    };

    let find = |key: &str| {
        entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let reason = find(RESULT_ERROR_REASON);
    let message = find(RESULT_ERROR_MESSAGE);

    (reason.is_some() || message.is_some()).then_some((reason, message))
}

/// Failure reason, message and location of a failed TaskRun. Reason and
/// message come from the first failed step that reported them; the location
/// is the pod and its first failed container.
pub fn failure_details(task_run: &TaskRun, pod: Option<&Pod>) -> Option<FailureDetails> {
    let status = task_run.status.as_ref()?;
    let failed = find_condition(&status.conditions, SUCCEEDED)
        .is_some_and(|c| c.status == ConditionStatus::False);
    if !failed {
        return None;
    }

    let mut details = FailureDetails::default();

    if let Some((reason, message)) = status
        .steps
        .iter()
        .filter_map(|step| step.terminated.as_ref())
        .filter(|t| t.exit_code != 0)
        .filter_map(|t| t.message.as_deref())
        .filter(|m| !m.is_empty())
        .find_map(error_results)
    {
        details.reason = reason;
        details.message = message;
    }

    if let Some(pod) = pod {
        let container = failed_container(pod)
            .map(|(c, _)| c.name.clone())
            .unwrap_or_default();
        details.location = Some(Location {
            pod: pod.metadata.name.clone().unwrap_or_default(),
            container,
        });
    }

    (details != FailureDetails::default()).then_some(details)
}

/// Failure details of a failed PipelineRun: the reason and message reported
/// by its first failed child TaskRun, at `located` when the condition mapping
/// already pinned down the failing pod and container.
pub fn pipeline_failure_details(
    children: &[ChildRun<'_>],
    located: Option<FailureDetails>,
) -> Option<FailureDetails> {
    let reported = children
        .iter()
        .find_map(|child| failure_details(child.task_run, child.pod));

    match (reported, located) {
        (Some(mut details), Some(located)) => {
            if located.location.is_some() {
                details.location = located.location;
            }
            Some(details)
        }
        (reported, located) => reported.or(located),
    }
}

/// Time the last init container of the pod finished, i.e. when the build
/// steps could start running.
pub fn pod_init_finished(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()?
        .init_container_statuses
        .as_ref()?
        .last()?
        .state
        .as_ref()?
        .terminated
        .as_ref()?
        .finished_at
        .as_ref()
        .and_then(time_to_utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::common::{Condition, utc_to_time};
    use crate::crds::tekton::{StepState, TaskRunSpec, TaskRunStatus};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateTerminated, ContainerStatus, PodSpec, PodStatus,
    };
    use kube::api::ObjectMeta;

    fn terminated(exit_code: i32, message: Option<&str>) -> ContainerStateTerminated {
        ContainerStateTerminated {
            exit_code,
            message: message.map(str::to_string),
            ..Default::default()
        }
    }

    fn task_run(status: ConditionStatus, steps: Vec<StepState>) -> TaskRun {
        let mut task_run = TaskRun::new("buildah-run-x7k2p", TaskRunSpec::default());
        task_run.status = Some(TaskRunStatus {
            conditions: vec![Condition::succeeded(status, "Failed", "step failed")],
            steps,
            ..Default::default()
        });
        task_run
    }

    fn step(name: &str, terminated: ContainerStateTerminated) -> StepState {
        StepState {
            name: Some(name.to_string()),
            container: Some(format!("step-{name}")),
            terminated: Some(terminated),
        }
    }

    fn failed_pod() -> Pod {
        let status = |name: &str, exit_code: i32| ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(terminated(exit_code, None)),
                ..Default::default()
            }),
            ..Default::default()
        };
        Pod {
            metadata: ObjectMeta {
                name: Some("buildah-run-x7k2p-pod".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    Container {
                        name: "step-source-default".to_string(),
                        ..Default::default()
                    },
                    Container {
                        name: "step-build".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(vec![
                    status("step-source-default", 0),
                    status("step-build", 1),
                ]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn reason_and_message_come_from_the_failed_step() {
        let message = r#"[{"key":"shp-error-reason","value":"GitRemotePrivate"},{"key":"shp-error-message","value":"remote repository unreachable"}]"#;
        let task_run = task_run(
            ConditionStatus::False,
            vec![
                step("source-default", terminated(1, Some(message))),
                step("build", terminated(0, None)),
            ],
        );

        let details = failure_details(&task_run, Some(&failed_pod())).unwrap();

        assert_eq!(details.reason.as_deref(), Some("GitRemotePrivate"));
        assert_eq!(details.message.as_deref(), Some("remote repository unreachable"));
        assert_eq!(
            details.location,
            Some(Location {
                pod: "buildah-run-x7k2p-pod".to_string(),
                container: "step-build".to_string(),
            })
        );
    }

    #[test]
    fn unparsable_messages_leave_only_the_location() {
        let task_run = task_run(
            ConditionStatus::False,
            vec![step("build", terminated(1, Some("exit status 1")))],
        );

        let details = failure_details(&task_run, Some(&failed_pod())).unwrap();

        assert_eq!(details.reason, None);
        assert_eq!(details.message, None);
        assert!(details.location.is_some());
    }

    #[test]
    fn nothing_is_reported_without_a_signal() {
        let running = task_run(ConditionStatus::Unknown, vec![]);
        assert_eq!(failure_details(&running, Some(&failed_pod())), None);

        let failed = task_run(ConditionStatus::False, vec![]);
        assert_eq!(failure_details(&failed, None), None);
    }

    #[test]
    fn pipeline_failure_takes_the_reason_of_the_failed_child() {
        let message = r#"[{"key":"shp-error-reason","value":"GitRemotePrivate"},{"key":"shp-error-message","value":"remote repository unreachable"}]"#;
        let succeeded = task_run(ConditionStatus::True, vec![]);
        let failed = task_run(
            ConditionStatus::False,
            vec![step("source-default", terminated(1, Some(message)))],
        );
        let pod = failed_pod();
        let children = [
            ChildRun {
                task_run: &succeeded,
                pod: None,
            },
            ChildRun {
                task_run: &failed,
                pod: None,
            },
        ];
        let located = FailureDetails {
            location: Some(Location {
                pod: "buildah-run-x7k2p-pod".to_string(),
                container: "step-build".to_string(),
            }),
            ..Default::default()
        };

        let details = pipeline_failure_details(&children, Some(located.clone())).unwrap();
        assert_eq!(details.reason.as_deref(), Some("GitRemotePrivate"));
        assert_eq!(details.message.as_deref(), Some("remote repository unreachable"));
        assert_eq!(details.location, located.location);

        let quiet = task_run(ConditionStatus::False, vec![]);
        let children = [ChildRun {
            task_run: &quiet,
            pod: Some(&pod),
        }];
        let details = pipeline_failure_details(&children, None).unwrap();
        assert_eq!(details.reason, None);
        assert_eq!(details.location.unwrap().container, "step-build");

        assert_eq!(pipeline_failure_details(&[], None), None);
    }

    #[test]
    fn init_finished_uses_the_last_init_container() {
        let at = |s: i64| ContainerStatus {
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    finished_at: DateTime::from_timestamp(s, 0).and_then(utc_to_time),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pod = Pod {
            status: Some(PodStatus {
                init_container_statuses: Some(vec![at(1_700_000_000), at(1_700_000_030)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            pod_init_finished(&pod).map(|t| t.timestamp()),
            Some(1_700_000_030)
        );
        assert_eq!(pod_init_finished(&Pod::default()), None);
    }
}
