use std::{collections::HashMap, sync::Arc};

use build_core::{
    crds::{Build, BuildRun, PipelineRun, TaskRun},
    labels::BUILD_RUN_NAME,
};
use futures::StreamExt;
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        WatchStreamExt,
        watcher::{self, Config, Event},
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    error::AppError,
    services::{
        backend::Job,
        predicates,
        work_queue::{ObjectKey, WorkQueue},
    },
};

fn object_key<K: Resource>(object: &K) -> ObjectKey {
    ObjectKey::new(object.namespace().unwrap_or_default(), object.name_any())
}

/// The BuildRun a job event is about, read from its ownership label.
fn owner_key(job: &Job) -> Option<ObjectKey> {
    let buildrun = job.labels().get(BUILD_RUN_NAME)?;
    Some(ObjectKey::new(job.namespace().unwrap_or_default(), buildrun.as_str()))
}

/// The Build a BuildRun references, for limit enforcement.
fn build_key(buildrun: &BuildRun) -> ObjectKey {
    ObjectKey::new(buildrun.namespace().unwrap_or_default(), buildrun.build_name())
}

/// Where watch events land.
#[derive(Clone, Default)]
pub struct WatchQueues {
    pub buildruns: Arc<WorkQueue>,
    /// BuildRuns whose TTL to check.
    pub ttl: Arc<WorkQueue>,
    /// Builds whose limits to enforce.
    pub limits: Arc<WorkQueue>,
}

impl WatchQueues {
    pub async fn shutdown(&self) {
        for queue in [&self.buildruns, &self.ttl, &self.limits] {
            queue.shutdown().await;
        }
    }
}

/// Keys one event queues, per queue.
#[derive(Debug, Default, PartialEq)]
pub struct Routed {
    pub buildrun: Option<ObjectKey>,
    pub ttl: Option<ObjectKey>,
    pub limits: Option<ObjectKey>,
}

/// Last seen BuildRuns, Builds and jobs, so update events can be told apart
/// from creations and compared with what came before.
#[derive(Default)]
pub struct Seen {
    buildruns: HashMap<ObjectKey, BuildRun>,
    builds: HashMap<ObjectKey, Build>,
    jobs: HashMap<ObjectKey, Job>,
}

impl Seen {
    /// Retention work a BuildRun event calls for. Reads the previous object,
    /// so it goes before [`Seen::buildrun_event`] records the new one.
    pub fn retention_event(&self, event: &Event<BuildRun>) -> Routed {
        match event {
            Event::Apply(buildrun) => {
                let key = object_key(buildrun);
                match self.buildruns.get(&key) {
                    None => Routed {
                        ttl: predicates::ttl_applies(buildrun).then_some(key),
                        ..Default::default()
                    },
                    Some(old) => Routed {
                        ttl: predicates::ttl_updated(old, buildrun).then_some(key),
                        limits: predicates::buildrun_finished(old, buildrun)
                            .then(|| build_key(buildrun)),
                        ..Default::default()
                    },
                }
            }
            Event::InitApply(buildrun) => Routed {
                ttl: predicates::ttl_applies(buildrun).then(|| object_key(buildrun)),
                ..Default::default()
            },
            Event::Delete(_) | Event::Init | Event::InitDone => Routed::default(),
        }
    }

    /// The Build whose limits to enforce for a Build event, if any.
    pub fn build_event(&mut self, event: Event<Build>) -> Option<ObjectKey> {
        match event {
            Event::Apply(build) => {
                let key = object_key(&build);
                let interesting = match self.builds.insert(key.clone(), build.clone()) {
                    None => predicates::build_limits_set(&build),
                    Some(old) => predicates::build_limits_updated(&old, &build),
                };
                interesting.then_some(key)
            }
            Event::InitApply(build) => {
                let key = object_key(&build);
                let interesting = predicates::build_limits_set(&build);
                self.builds.insert(key.clone(), build);
                interesting.then_some(key)
            }
            Event::Delete(build) => {
                self.builds.remove(&object_key(&build));
                None
            }
            Event::Init | Event::InitDone => None,
        }
    }

    /// The BuildRun to reconcile for a BuildRun event, if any.
    pub fn buildrun_event(&mut self, event: Event<BuildRun>) -> Option<ObjectKey> {
        match event {
            Event::Apply(buildrun) => {
                let key = object_key(&buildrun);
                let interesting = match self.buildruns.insert(key.clone(), buildrun.clone()) {
                    None => predicates::buildrun_created(&buildrun),
                    Some(old) => predicates::buildrun_updated(&old, &buildrun),
                };
                interesting.then_some(key)
            }
            // a relist after restart also picks up BuildRuns whose job moved on
            // while nobody was watching
            Event::InitApply(buildrun) => {
                let key = object_key(&buildrun);
                let interesting = !buildrun.is_done();
                self.buildruns.insert(key.clone(), buildrun);
                interesting.then_some(key)
            }
            Event::Delete(buildrun) => {
                self.buildruns.remove(&object_key(&buildrun));
                None
            }
            Event::Init | Event::InitDone => None,
        }
    }

    /// The owning BuildRun to reconcile for a job event, if any.
    pub fn job_event(&mut self, event: Event<Job>) -> Option<ObjectKey> {
        match event {
            Event::Apply(job) | Event::InitApply(job) => {
                let owner = owner_key(&job)?;
                let key = ObjectKey::new(job.namespace().unwrap_or_default(), job.name());
                let interesting = match self.jobs.insert(key, job.clone()) {
                    None => job.start_time().is_some() || job.condition().is_some(),
                    Some(old) => predicates::job_updated(&old, &job),
                };
                interesting.then_some(owner)
            }
            Event::Delete(job) => {
                let key = ObjectKey::new(job.namespace().unwrap_or_default(), job.name());
                self.jobs.remove(&key);
                let owner = owner_key(&job)?;
                predicates::job_deleted(&job).then_some(owner)
            }
            Event::Init | Event::InitDone => None,
        }
    }
}

fn into_job_event<K>(event: Event<K>, job: fn(K) -> Job) -> Event<Job> {
    match event {
        Event::Apply(k) => Event::Apply(job(k)),
        Event::InitApply(k) => Event::InitApply(job(k)),
        Event::Delete(k) => Event::Delete(job(k)),
        Event::Init => Event::Init,
        Event::InitDone => Event::InitDone,
    }
}

fn log_watch_error(resource: &str, e: &watcher::Error) {
    error!(resource, error = %e, "⚠️ Watcher error");
}

/// Watches BuildRuns, Builds and the jobs labelled as theirs, queueing the
/// keys whose events pass the predicates.
pub async fn event_watcher(client: Client, queues: WatchQueues) -> Result<(), AppError> {
    let job_config = Config::default().labels(BUILD_RUN_NAME);

    let buildruns: Api<BuildRun> = Api::all(client.clone());
    let builds: Api<Build> = Api::all(client.clone());
    let task_runs: Api<TaskRun> = Api::all(client.clone());
    let pipeline_runs: Api<PipelineRun> = Api::all(client);

    let mut buildrun_stream = watcher::watcher(buildruns, Config::default())
        .default_backoff()
        .boxed();
    let mut build_stream = watcher::watcher(builds, Config::default())
        .default_backoff()
        .boxed();
    let mut task_run_stream = watcher::watcher(task_runs, job_config.clone())
        .default_backoff()
        .boxed();
    let mut pipeline_run_stream = watcher::watcher(pipeline_runs, job_config)
        .default_backoff()
        .boxed();

    let mut seen = Seen::default();

    info!("🔍 Starting Kubernetes watchers");
    loop {
        let routed = tokio::select! {
            Some(event) = buildrun_stream.next() => match event {
                Ok(event) => {
                    let retention = seen.retention_event(&event);
                    Routed {
                        buildrun: seen.buildrun_event(event),
                        ..retention
                    }
                }
                Err(e) => {
                    log_watch_error("buildruns", &e);
                    Routed::default()
                }
            },
            Some(event) = build_stream.next() => match event {
                Ok(event) => Routed {
                    limits: seen.build_event(event),
                    ..Default::default()
                },
                Err(e) => {
                    log_watch_error("builds", &e);
                    Routed::default()
                }
            },
            Some(event) = task_run_stream.next() => match event {
                Ok(event) => Routed {
                    buildrun: seen.job_event(into_job_event(event, Job::TaskRun)),
                    ..Default::default()
                },
                Err(e) => {
                    log_watch_error("taskruns", &e);
                    Routed::default()
                }
            },
            Some(event) = pipeline_run_stream.next() => match event {
                Ok(event) => Routed {
                    buildrun: seen.job_event(into_job_event(event, Job::PipelineRun)),
                    ..Default::default()
                },
                Err(e) => {
                    log_watch_error("pipelineruns", &e);
                    Routed::default()
                }
            },
            else => {
                warn!("❌ All watcher streams ended unexpectedly");
                break;
            }
        };

        if let Some(key) = routed.buildrun {
            debug!(%key, "📥 Queueing BuildRun");
            queues.buildruns.add(key).await;
        }
        if let Some(key) = routed.ttl {
            debug!(%key, "📥 Queueing BuildRun TTL check");
            queues.ttl.add(key).await;
        }
        if let Some(key) = routed.limits {
            debug!(%key, "📥 Queueing Build limit cleanup");
            queues.limits.add(key).await;
        }
    }

    Err(AppError::InternalServerError("watcher streams ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use build_core::crds::{
        BuildRunSpec, BuildSpec, Condition, ConditionStatus,
        build::BuildRetention,
        buildrun::{BUILD_RUN_STATE_CANCEL, BuildExecutor, ReferencedBuild},
        tekton::TaskRunStatus,
    };
    use chrono::Utc;

    use crate::services::fake::task_run;

    fn buildrun() -> BuildRun {
        let mut buildrun = BuildRun::new("run", BuildRunSpec::default());
        buildrun.metadata.namespace = Some("builds".to_string());
        buildrun
    }

    fn job(condition: Option<Condition>, completed: bool) -> Job {
        let mut tr = task_run("builds", "run-00001", "run");
        tr.status = Some(TaskRunStatus {
            conditions: condition.into_iter().collect(),
            completion_time: completed.then(Utc::now),
            ..Default::default()
        });
        Job::TaskRun(tr)
    }

    fn running(message: &str) -> Condition {
        Condition::succeeded(ConditionStatus::Unknown, "Running", message)
    }

    fn key() -> Option<ObjectKey> {
        Some(ObjectKey::new("builds", "run"))
    }

    #[test]
    fn new_buildruns_are_queued_until_started() {
        let mut seen = Seen::default();
        assert_eq!(seen.buildrun_event(Event::Apply(buildrun())), key());

        let mut started = buildrun();
        started.status_mut().executor = Some(BuildExecutor {
            name: "run-00001".to_string(),
            kind: "TaskRun".to_string(),
        });
        let mut seen = Seen::default();
        assert_eq!(seen.buildrun_event(Event::Apply(started)), None);
    }

    #[test]
    fn buildrun_updates_only_queue_cancellation() {
        let mut seen = Seen::default();
        seen.buildrun_event(Event::Apply(buildrun()));

        let mut relabelled = buildrun();
        relabelled
            .labels_mut()
            .insert("team".to_string(), "a".to_string());
        assert_eq!(seen.buildrun_event(Event::Apply(relabelled)), None);

        let mut canceled = buildrun();
        canceled.spec.state = Some(BUILD_RUN_STATE_CANCEL.to_string());
        assert_eq!(seen.buildrun_event(Event::Apply(canceled)), key());
    }

    #[test]
    fn relisted_running_buildruns_are_queued() {
        let mut seen = Seen::default();
        let mut started = buildrun();
        started.status_mut().executor = Some(BuildExecutor {
            name: "run-00001".to_string(),
            kind: "TaskRun".to_string(),
        });
        assert_eq!(seen.buildrun_event(Event::InitApply(started)), key());

        let mut finished = buildrun();
        finished.status_mut().completion_time = Some(Utc::now());
        assert_eq!(seen.buildrun_event(Event::InitApply(finished)), None);
    }

    #[test]
    fn job_events_queue_the_owning_buildrun() {
        let mut seen = Seen::default();
        assert_eq!(seen.job_event(Event::Apply(job(None, false))), None);
        assert_eq!(seen.job_event(Event::Apply(job(Some(running("")), false))), key());
        assert_eq!(seen.job_event(Event::Apply(job(Some(running("")), false))), None);
        assert_eq!(seen.job_event(Event::Apply(job(Some(running("pulling")), false))), key());
    }

    #[test]
    fn unlabelled_jobs_are_ignored() {
        let mut seen = Seen::default();
        let mut stray = TaskRun::new("stray", Default::default());
        stray.status = Some(TaskRunStatus {
            conditions: vec![running("")],
            ..Default::default()
        });
        assert_eq!(seen.job_event(Event::Apply(Job::TaskRun(stray))), None);
    }

    #[test]
    fn only_unfinished_job_deletions_queue() {
        let mut seen = Seen::default();
        assert_eq!(seen.job_event(Event::Delete(job(None, false))), key());
        assert_eq!(seen.job_event(Event::Delete(job(None, true))), None);
    }

    fn ended(buildrun: &BuildRun, status: ConditionStatus) -> BuildRun {
        let mut ended = buildrun.clone();
        ended.status_mut().conditions = vec![Condition::succeeded(status, "", "")];
        ended.status_mut().completion_time = Some(Utc::now());
        ended
    }

    #[test]
    fn completion_routes_ttl_and_limits() {
        let mut seen = Seen::default();
        let mut started = buildrun();
        started.spec.build = ReferencedBuild {
            name: Some("buildah-golang".to_string()),
            ..Default::default()
        };
        started.spec.retention = Some(BuildRetention {
            ttl_after_failed: Some("1h".to_string()),
            ..Default::default()
        });
        let event = Event::Apply(started.clone());
        assert_eq!(seen.retention_event(&event), Routed::default());
        seen.buildrun_event(event);

        let event = Event::Apply(ended(&started, ConditionStatus::False));
        assert_eq!(
            seen.retention_event(&event),
            Routed {
                buildrun: None,
                ttl: key(),
                limits: Some(ObjectKey::new("builds", "buildah-golang")),
            }
        );
        seen.buildrun_event(event);

        let again = Event::Apply(ended(&started, ConditionStatus::False));
        assert_eq!(seen.retention_event(&again), Routed::default());
    }

    #[test]
    fn relisted_finished_buildruns_with_ttl_are_checked() {
        let seen = Seen::default();
        let mut finished = ended(&buildrun(), ConditionStatus::True);
        assert_eq!(seen.retention_event(&Event::InitApply(finished.clone())), Routed::default());

        finished.spec.retention = Some(BuildRetention {
            ttl_after_succeeded: Some("10m".to_string()),
            ..Default::default()
        });
        assert_eq!(seen.retention_event(&Event::InitApply(finished)).ttl, key());
    }

    fn build(failed_limit: Option<u32>) -> Build {
        let mut build = Build::new(
            "buildah-golang",
            BuildSpec {
                retention: Some(BuildRetention {
                    failed_limit,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        build.metadata.namespace = Some("builds".to_string());
        build
    }

    #[test]
    fn builds_are_queued_when_limits_appear_or_shrink() {
        let mut seen = Seen::default();
        let queued = Some(ObjectKey::new("builds", "buildah-golang"));

        assert_eq!(seen.build_event(Event::Apply(build(None))), None);
        assert_eq!(seen.build_event(Event::Apply(build(Some(5)))), queued);
        assert_eq!(seen.build_event(Event::Apply(build(Some(5)))), None);
        assert_eq!(seen.build_event(Event::Apply(build(Some(7)))), None);
        assert_eq!(seen.build_event(Event::Apply(build(Some(2)))), queued);
        assert_eq!(seen.build_event(Event::InitApply(build(Some(2)))), queued);
    }
}
