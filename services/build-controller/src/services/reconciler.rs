use std::{sync::Arc, time::Duration};

use build_core::{
    compiler::{self, CompileInput, ExecutorKind},
    conditions::{
        self, BUILD_NOT_FOUND, BUILD_REGISTRATION_FAILED, BUILD_STRATEGY_NOT_FOUND, ChildRun,
        CLUSTER_BUILD_STRATEGY_NOT_FOUND, SERVICE_ACCOUNT_NOT_FOUND, SET_OWNER_REFERENCE_FAILED,
        TASK_RUN_IS_MISSING, UNKNOWN_STRATEGY_KIND,
    },
    configs::CompilerConfig,
    crds::{
        Build, BuildRun, BuildSpec, Condition, ConditionStatus, ResolvedStrategy,
        buildrun::{BUILD_RUN_STATE_CANCEL, BuildExecutor, BuildRunStatus},
        common::{SUCCEEDED, find_condition, set_condition, time_to_utc},
        strategy::{KIND_BUILD_STRATEGY, KIND_CLUSTER_BUILD_STRATEGY},
    },
    extractor, labels,
    validate::{self, ValidationError},
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::{
    error::AppError,
    services::{
        backend::{self, Job},
        cluster::ClusterClient,
        credentials::{self, ServiceAccountLookup},
        metrics::{BuildMetrics, BuildRunLabels},
        work_queue::{ObjectKey, WorkQueue},
    },
};

type Checked<T> = Result<T, ValidationError>;

/// Drives one BuildRun from creation to a terminal condition.
pub struct Reconciler<C> {
    client: C,
    kind: ExecutorKind,
    compiler: CompilerConfig,
    metrics: BuildMetrics,
}

fn creation_time(buildrun: &BuildRun) -> DateTime<Utc> {
    buildrun
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(time_to_utc)
        .unwrap_or_else(Utc::now)
}

fn pod_creation_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().and_then(time_to_utc)
}

fn owned_by(build: &Build, buildrun: &BuildRun) -> bool {
    buildrun
        .owner_references()
        .iter()
        .any(|r| r.kind == Build::kind(&()) && r.name == build.name_any())
}

/// Keeps the previous condition, and its transition time, when nothing a user
/// can see changed.
fn set_succeeded(status: &mut BuildRunStatus, condition: Condition) {
    let unchanged = find_condition(&status.conditions, SUCCEEDED).is_some_and(|c| {
        c.status == condition.status && c.reason == condition.reason && c.message == condition.message
    });
    if !unchanged {
        set_condition(&mut status.conditions, condition);
    }
}

impl<C: ClusterClient> Reconciler<C> {
    pub fn new(client: C, kind: ExecutorKind, compiler: CompilerConfig, metrics: BuildMetrics) -> Self {
        Self {
            client,
            kind,
            compiler,
            metrics,
        }
    }

    #[tracing::instrument(
        name = "buildrun.reconcile",
        skip_all,
        fields(namespace = %key.namespace, name = %key.name),
        err
    )]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), AppError> {
        let Some(buildrun) = self.client.get_buildrun(&key.namespace, &key.name).await? else {
            debug!("BuildRun is gone, nothing to do");
            return Ok(());
        };

        let kind = backend::job_kind(&buildrun, self.kind);

        if let Some(job_name) = buildrun.executor_name() {
            let job = backend::get_job(&self.client, kind, &key.namespace, job_name).await?;
            let loaded = buildrun.status.clone();
            return self.sync_job(buildrun, job, loaded).await;
        }

        if buildrun.is_done() {
            debug!("BuildRun already completed");
            return Ok(());
        }

        let mut buildrun = buildrun;
        if let Err(e) = validate::buildrun_fields(&buildrun) {
            return self.fail(&mut buildrun, e.reason, e.message).await;
        }

        // a job created by an attempt that never recorded it
        if let Some(job) = backend::find_job(&self.client, kind, &buildrun).await? {
            info!(job = %job.name(), "♻️ Adopting existing job");
            let loaded = buildrun.status.clone();
            let rampup = job.creation_time().unwrap_or_else(Utc::now) - creation_time(&buildrun);
            self.record_executor(&mut buildrun, &job).await?;

            let recorded = buildrun.clone();
            self.sync_job(buildrun, Some(job), loaded).await?;
            self.metrics.rampup_observe(&self.labels(&recorded), rampup);
            return Ok(());
        }

        self.start(buildrun).await
    }

    /// Marks the BuildRun failed. A terminal failure is not retried, so a
    /// failed status write is reported as [`AppError::ClientStatusUpdate`].
    async fn fail(
        &self,
        buildrun: &mut BuildRun,
        reason: &str,
        message: impl Into<String>,
    ) -> Result<(), AppError> {
        let message = message.into();
        warn!(reason, message = %message, "❌ BuildRun failed");

        let status = buildrun.status_mut();
        set_succeeded(status, conditions::failed(reason, message));
        status.completion_time.get_or_insert_with(Utc::now);

        self.client
            .update_buildrun_status(buildrun)
            .await
            .map_err(|e| AppError::ClientStatusUpdate(Box::new(e)))?;
        Ok(())
    }

    async fn record_executor(&self, buildrun: &mut BuildRun, job: &Job) -> Result<(), AppError> {
        let build_spec = match buildrun.status_ref().and_then(|s| s.build_spec.clone()) {
            Some(spec) => Some(spec),
            None => self.build_spec(buildrun).await?,
        };

        let status = buildrun.status_mut();
        status.build_spec = build_spec;
        status.executor = Some(BuildExecutor {
            name: job.name(),
            kind: job.kind().to_string(),
        });
        Ok(())
    }

    async fn build_spec(&self, buildrun: &BuildRun) -> Result<Option<BuildSpec>, AppError> {
        if let Some(spec) = &buildrun.spec.build.spec {
            return Ok(Some((**spec).clone()));
        }
        let namespace = buildrun.namespace().unwrap_or_default();
        Ok(self
            .client
            .get_build(&namespace, buildrun.build_name())
            .await?
            .map(|build| build.spec))
    }

    fn labels<'a>(&self, buildrun: &'a BuildRun) -> BuildRunLabels<'a> {
        BuildRunLabels {
            strategy: buildrun
                .status_ref()
                .and_then(|s| s.build_spec.as_ref())
                .map(|spec| spec.strategy_name())
                .unwrap_or_default(),
            namespace: buildrun.metadata.namespace.as_deref().unwrap_or_default(),
            build: buildrun.build_name(),
            buildrun: buildrun.metadata.name.as_deref().unwrap_or_default(),
        }
    }

    /// The Build to run: the referenced one once registered, or a transient
    /// one carrying the embedded spec.
    async fn load_build(&self, buildrun: &BuildRun) -> Result<Checked<Build>, AppError> {
        let namespace = buildrun.namespace().unwrap_or_default();

        let Some(name) = buildrun.spec.build.name.as_deref() else {
            let spec = buildrun.spec.build.spec.as_deref().cloned().unwrap_or_default();
            let mut build = Build::new("", spec);
            build.metadata.namespace = Some(namespace);
            return Ok(Ok(build));
        };

        let Some(build) = self.client.get_build(&namespace, name).await? else {
            return Ok(Err(ValidationError::new(
                BUILD_NOT_FOUND,
                format!("build.shipwright.io {name:?} not found"),
            )));
        };

        let status = build.status.as_ref();
        match status.and_then(|s| s.registered) {
            Some(ConditionStatus::True) => Ok(Ok(build)),
            Some(registered @ ConditionStatus::False) => {
                let reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default();
                Ok(Err(ValidationError::new(
                    BUILD_REGISTRATION_FAILED,
                    format!(
                        "the Build is not registered correctly, build: {name}, registered status: {registered}, reason: {reason}"
                    ),
                )))
            }
            _ => Err(AppError::NotReady(format!(
                "the Build is not yet validated, build: {name}"
            ))),
        }
    }

    async fn resolve_strategy(
        &self,
        build: &Build,
        namespace: &str,
    ) -> Result<Checked<ResolvedStrategy>, AppError> {
        let name = build.spec.strategy_name();

        match build.spec.strategy.kind.as_deref() {
            None | Some(KIND_BUILD_STRATEGY) => {
                Ok(match self.client.get_build_strategy(namespace, name).await? {
                    Some(strategy) => Ok(strategy.into()),
                    None => Err(ValidationError::new(
                        BUILD_STRATEGY_NOT_FOUND,
                        format!("buildstrategies.shipwright.io {name:?} not found"),
                    )),
                })
            }
            Some(KIND_CLUSTER_BUILD_STRATEGY) => {
                Ok(match self.client.get_cluster_build_strategy(name).await? {
                    Some(strategy) => Ok(strategy.into()),
                    None => Err(ValidationError::new(
                        CLUSTER_BUILD_STRATEGY_NOT_FOUND,
                        format!("clusterbuildstrategies.shipwright.io {name:?} not found"),
                    )),
                })
            }
            Some(other) => Ok(Err(ValidationError::new(
                UNKNOWN_STRATEGY_KIND,
                format!("unknown strategy {other}"),
            ))),
        }
    }

    /// Unstarted to Creating: everything up to the job being created and
    /// recorded.
    async fn start(&self, mut buildrun: BuildRun) -> Result<(), AppError> {
        let namespace = buildrun.namespace().unwrap_or_default();

        let build = match self.load_build(&buildrun).await? {
            Ok(build) => build,
            Err(e) => return self.fail(&mut buildrun, e.reason, e.message).await,
        };

        if buildrun.is_canceled() {
            return self
                .fail(&mut buildrun, BUILD_RUN_STATE_CANCEL, "the BuildRun is marked canceled.")
                .await;
        }

        let mut update_required = false;

        let deletes_with_build = build
            .annotations()
            .get(labels::ANNOTATION_BUILD_RUN_DELETION)
            .is_some_and(|v| v == "true");
        if deletes_with_build && !owned_by(&build, &buildrun) {
            let Some(owner) = build.controller_owner_ref(&()) else {
                let message = format!(
                    "unexpected error when trying to set the ownerreference: Build {} has no uid",
                    build.name_any()
                );
                return self
                    .fail(&mut buildrun, SET_OWNER_REFERENCE_FAILED, message)
                    .await;
            };
            info!(build = %build.name_any(), "🔗 Build becomes owner of the BuildRun");
            buildrun.owner_references_mut().push(owner);
            update_required = true;
        }

        let generation = build.metadata.generation.unwrap_or_default();
        if !build.name_any().is_empty() && generation != 0 {
            let generation = generation.to_string();
            let run_labels = buildrun.labels();
            if run_labels.get(labels::BUILD_NAME) != Some(&build.name_any())
                || run_labels.get(labels::BUILD_GENERATION) != Some(&generation)
            {
                let run_labels = buildrun.labels_mut();
                run_labels.insert(labels::BUILD_NAME.to_string(), build.name_any());
                run_labels.insert(labels::BUILD_GENERATION.to_string(), generation);
                update_required = true;
            }
        }

        if update_required {
            buildrun = self.client.update_buildrun(&buildrun).await?;
            debug!("📝 BuildRun labels and owners updated");
        }

        buildrun.status_mut().build_spec = Some(build.spec.clone());

        let service_account =
            match credentials::retrieve_service_account(&self.client, &build, &buildrun).await? {
                ServiceAccountLookup::Found(sa) => sa,
                ServiceAccountLookup::Missing(name) => {
                    let message = format!("service account {name} not found");
                    return self
                        .fail(&mut buildrun, SERVICE_ACCOUNT_NOT_FOUND, message)
                        .await;
                }
            };

        let strategy = match self.resolve_strategy(&build, &namespace).await? {
            Ok(strategy) => strategy,
            Err(e) => return self.fail(&mut buildrun, e.reason, e.message).await,
        };

        if buildrun.spec.build.spec.is_some()
            && let Err(e) = validate::embedded_build_spec(&build.spec, &strategy)
        {
            return self.fail(&mut buildrun, e.reason, e.message).await;
        }

        if let Err(e) = validate::buildrun_parameters(
            &strategy.spec.parameters,
            &build.spec.param_values,
            &buildrun.spec.param_values,
        ) {
            return self.fail(&mut buildrun, e.reason, e.message).await;
        }

        let service_account = service_account.name_any();
        let compiled = compiler::compile(
            self.kind,
            CompileInput {
                config: &self.compiler,
                build: &build,
                buildrun: &buildrun,
                service_account: &service_account,
                strategy: &strategy,
            },
        );
        let executor = match compiled {
            Ok(executor) => executor,
            Err(e) => {
                let reason = e.reason(self.kind);
                return self.fail(&mut buildrun, reason, e.to_string()).await;
            }
        };

        let job = backend::create_job(&self.client, executor, &buildrun).await?;

        buildrun.status_mut().executor = Some(BuildExecutor {
            name: job.name(),
            kind: job.kind().to_string(),
        });
        let buildrun = self.client.update_buildrun_status(&buildrun).await?;

        let rampup = job.creation_time().unwrap_or_else(Utc::now) - creation_time(&buildrun);
        self.metrics.rampup_observe(&self.labels(&buildrun), rampup);
        Ok(())
    }

    /// Creating, Running and terminal states: mirrors the job onto the BuildRun.
    /// Status is written whenever it differs from `loaded`, the status as read
    /// from the cluster.
    async fn sync_job(
        &self,
        mut buildrun: BuildRun,
        job: Option<Job>,
        loaded: Option<BuildRunStatus>,
    ) -> Result<(), AppError> {
        let namespace = buildrun.namespace().unwrap_or_default();

        let Some(job) = job else {
            if buildrun.is_done() {
                return Ok(());
            }
            let message = format!(
                "taskRun {} doesn't exist",
                buildrun.executor_name().unwrap_or_default()
            );
            return self.fail(&mut buildrun, TASK_RUN_IS_MISSING, message).await;
        };

        if buildrun.is_canceled() && !job.is_cancelled() {
            info!(job = %job.name(), "🛑 BuildRun marked for cancellation");
            backend::cancel_job(&self.client, &namespace, &job).await?;
        }

        if buildrun.is_done() {
            debug!("BuildRun already completed");
            return credentials::delete_leftover(&self.client, &buildrun).await;
        }

        let completed = job.completion_time().is_some();

        // the pod whose init containers and failures describe the run
        let mut pod = None;
        let mapped = match &job {
            Job::TaskRun(task_run) => {
                if completed {
                    pod = backend::execution_pod(&self.client, task_run).await?;
                }
                let results = task_run
                    .status
                    .as_ref()
                    .map(|s| s.results.clone())
                    .unwrap_or_default();
                extractor::apply_results(buildrun.status_mut(), &results);

                job.condition().map(|condition| {
                    let condition =
                        conditions::from_task_run(&buildrun, task_run, condition, pod.as_ref());
                    (condition, extractor::failure_details(task_run, pod.as_ref()))
                })
            }
            Job::PipelineRun(pipeline_run) => {
                let children = backend::child_task_runs(&self.client, pipeline_run).await?;
                let mut pods = Vec::with_capacity(children.len());
                for child in &children {
                    let pod = if completed {
                        backend::execution_pod(&self.client, child).await?
                    } else {
                        None
                    };
                    pods.push(pod);
                }
                pod = pods.last().cloned().flatten();

                let results = extractor::child_results(pipeline_run, &children);
                extractor::apply_results(buildrun.status_mut(), &results);

                let runs: Vec<ChildRun<'_>> = children
                    .iter()
                    .zip(&pods)
                    .map(|(task_run, pod)| ChildRun {
                        task_run,
                        pod: pod.as_ref(),
                    })
                    .collect();
                job.condition().map(|condition| {
                    let (condition, located) =
                        conditions::from_pipeline_run(&buildrun, pipeline_run, condition, &runs);
                    let details = if condition.status == ConditionStatus::False {
                        extractor::pipeline_failure_details(&runs, located)
                    } else {
                        located
                    };
                    (condition, details)
                })
            }
        };

        let mut terminal = false;
        if let Some((condition, failure_details)) = mapped {
            terminal = condition.is_terminal();
            let status = buildrun.status_mut();
            set_succeeded(status, condition);
            status.failure_details = failure_details;
        }

        let status = buildrun.status_mut();
        status.executor = Some(BuildExecutor {
            name: job.name(),
            kind: job.kind().to_string(),
        });

        let mut started = None;
        if status.start_time.is_none()
            && let Some(start) = job.start_time()
        {
            status.start_time = Some(start);
            started = Some(start);
        }

        let mut finished = None;
        if status.completion_time.is_none()
            && let Some(completion) = job.completion_time()
        {
            status.completion_time = Some(completion);
            finished = Some(completion);
        }

        if buildrun.status != loaded {
            let write = self.client.update_buildrun_status(&buildrun).await;
            match write {
                Ok(updated) => buildrun = updated,
                Err(e) if terminal => return Err(AppError::ClientStatusUpdate(Box::new(e))),
                Err(e) => return Err(e),
            }
        }

        let created = creation_time(&buildrun);
        let labels = self.labels(&buildrun);
        if let Some(start) = started {
            self.metrics.establish_observe(&labels, start - created);
        }
        if let Some(completion) = finished {
            info!(job = %job.name(), "🏁 BuildRun completed");
            self.metrics.completed_inc(&labels);
            self.metrics.completion_observe(&labels, completion - created);

            if let Some(pod) = &pod
                && let Some(pod_created) = pod_creation_time(pod)
            {
                if let Some(job_created) = job.creation_time() {
                    self.metrics.job_rampup_observe(&labels, pod_created - job_created);
                }
                if let Some(init_finished) = extractor::pod_init_finished(pod) {
                    self.metrics.pod_rampup_observe(&labels, init_finished - pod_created);
                }
            }
        }

        // only once the terminal condition is stored, so a retried status
        // write never deletes twice
        if terminal {
            credentials::delete_generated(&self.client, &buildrun).await?;
        }

        Ok(())
    }
}

/// Takes keys off the queue until it shuts down. Each reconcile runs under
/// `deadline`; a failed or expired one is retried with backoff.
pub async fn run_worker<C: ClusterClient>(
    worker: usize,
    reconciler: Arc<Reconciler<C>>,
    queue: Arc<WorkQueue>,
    deadline: Duration,
) -> Result<(), AppError> {
    debug!(worker, "👷 Worker started");

    while let Some(key) = queue.get().await {
        match tokio::time::timeout(deadline, reconciler.reconcile(&key)).await {
            Ok(Ok(())) => queue.forget(&key).await,
            Ok(Err(AppError::NotReady(reason))) => {
                info!(%key, %reason, "⏳ BuildRun not ready yet");
                queue.add_rate_limited(key.clone()).await;
            }
            Ok(Err(e @ AppError::ClientStatusUpdate(_))) => {
                warn!(%key, error = %e, "⚠️ Terminal decision not persisted, retrying");
                queue.add_rate_limited(key.clone()).await;
            }
            Ok(Err(e)) => {
                error!(%key, error = %e, "❌ Reconcile failed");
                queue.add_rate_limited(key.clone()).await;
            }
            Err(_) => {
                warn!(%key, ?deadline, "⏱️ Reconcile exceeded its deadline");
                queue.add_rate_limited(key.clone()).await;
            }
        }
        queue.done(&key).await;
    }

    debug!(worker, "Worker stopped");
    Ok(())
}
