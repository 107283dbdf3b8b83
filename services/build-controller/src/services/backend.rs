use std::collections::BTreeMap;

use build_core::{
    compiler::{Executor, ExecutorKind},
    crds::{
        BuildRun, Condition, PipelineRun, TaskRun,
        common::{SUCCEEDED, find_condition, time_to_utc},
        tekton::{
            KIND_TASK_RUN, PIPELINE_RUN_SPEC_STATUS_CANCELLED, TASK_RUN_SPEC_STATUS_CANCELLED,
        },
    },
    labels,
};
use chrono::{DateTime, Utc};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::{error::AppError, services::cluster::ClusterClient};

/// A job created for a BuildRun, whichever backend runs it.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    TaskRun(TaskRun),
    PipelineRun(PipelineRun),
}

impl Job {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            Job::TaskRun(_) => ExecutorKind::TaskRun,
            Job::PipelineRun(_) => ExecutorKind::PipelineRun,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Job::TaskRun(tr) => tr.name_any(),
            Job::PipelineRun(pr) => pr.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            Job::TaskRun(tr) => tr.namespace(),
            Job::PipelineRun(pr) => pr.namespace(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            Job::TaskRun(tr) => tr.labels(),
            Job::PipelineRun(pr) => pr.labels(),
        }
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        let created = match self {
            Job::TaskRun(tr) => tr.metadata.creation_timestamp.as_ref(),
            Job::PipelineRun(pr) => pr.metadata.creation_timestamp.as_ref(),
        };
        created.and_then(time_to_utc)
    }

    pub fn condition(&self) -> Option<&Condition> {
        let conditions = match self {
            Job::TaskRun(tr) => tr.status.as_ref().map(|s| s.conditions.as_slice()),
            Job::PipelineRun(pr) => pr.status.as_ref().map(|s| s.conditions.as_slice()),
        };
        conditions.and_then(|c| find_condition(c, SUCCEEDED))
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Job::TaskRun(tr) => tr.status.as_ref().and_then(|s| s.start_time),
            Job::PipelineRun(pr) => pr.status.as_ref().and_then(|s| s.start_time),
        }
    }

    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Job::TaskRun(tr) => tr.status.as_ref().and_then(|s| s.completion_time),
            Job::PipelineRun(pr) => pr.status.as_ref().and_then(|s| s.completion_time),
        }
    }

    /// Whether cancellation was already requested on the job.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Job::TaskRun(tr) => tr.spec.status.as_deref() == Some(TASK_RUN_SPEC_STATUS_CANCELLED),
            Job::PipelineRun(pr) => {
                pr.spec.status.as_deref() == Some(PIPELINE_RUN_SPEC_STATUS_CANCELLED)
            }
        }
    }
}

/// Backend the job of `buildrun` runs on: the kind recorded in its status, or
/// the configured one for a BuildRun that has no job yet.
pub fn job_kind(buildrun: &BuildRun, configured: ExecutorKind) -> ExecutorKind {
    buildrun
        .status_ref()
        .and_then(|s| s.executor.as_ref())
        .and_then(|e| e.kind.parse().ok())
        .unwrap_or(configured)
}

/// Controller owner reference pointing at `buildrun`.
pub fn controller_reference(buildrun: &BuildRun) -> Option<OwnerReference> {
    buildrun.controller_owner_ref(&())
}

pub async fn get_job<C: ClusterClient>(
    client: &C,
    kind: ExecutorKind,
    namespace: &str,
    name: &str,
) -> Result<Option<Job>, AppError> {
    Ok(match kind {
        ExecutorKind::TaskRun => client.get_task_run(namespace, name).await?.map(Job::TaskRun),
        ExecutorKind::PipelineRun => client
            .get_pipeline_run(namespace, name)
            .await?
            .map(Job::PipelineRun),
    })
}

/// The job already created for `buildrun`, found through its BuildRun label.
/// Several matches mean an earlier reconcile lost its status write; the
/// oldest one is kept.
pub async fn find_job<C: ClusterClient>(
    client: &C,
    kind: ExecutorKind,
    buildrun: &BuildRun,
) -> Result<Option<Job>, AppError> {
    let namespace = buildrun.namespace().unwrap_or_default();
    let selector = labels::job_selector(&buildrun.name_any());

    let mut jobs: Vec<Job> = match kind {
        ExecutorKind::TaskRun => client
            .list_task_runs(&namespace, &selector)
            .await?
            .into_iter()
            .map(Job::TaskRun)
            .collect(),
        ExecutorKind::PipelineRun => client
            .list_pipeline_runs(&namespace, &selector)
            .await?
            .into_iter()
            .map(Job::PipelineRun)
            .collect(),
    };

    if jobs.len() > 1 {
        warn!(
            buildrun = %buildrun.name_any(),
            count = jobs.len(),
            "⚠️ Several jobs carry the BuildRun label, using the oldest"
        );
    }
    jobs.sort_by_key(|job| job.creation_time());
    Ok(jobs.into_iter().next())
}

/// Creates the compiled job with `buildrun` as its controller.
#[tracing::instrument(
    name = "backend.create_job",
    skip_all,
    fields(buildrun = %buildrun.name_any()),
    err
)]
pub async fn create_job<C: ClusterClient>(
    client: &C,
    executor: Executor,
    buildrun: &BuildRun,
) -> Result<Job, AppError> {
    let owner = controller_reference(buildrun);

    let job = match executor {
        Executor::TaskRun(mut task_run) => {
            task_run.owner_references_mut().extend(owner);
            Job::TaskRun(client.create_task_run(&task_run).await?)
        }
        Executor::PipelineRun(mut pipeline_run) => {
            pipeline_run.owner_references_mut().extend(owner);
            Job::PipelineRun(client.create_pipeline_run(&pipeline_run).await?)
        }
    };

    info!(
        buildrun = %buildrun.name_any(),
        kind = %job.kind(),
        job = %job.name(),
        "🚀 Job created"
    );
    Ok(job)
}

#[tracing::instrument(name = "backend.cancel_job", skip_all, fields(job = %job.name()), err)]
pub async fn cancel_job<C: ClusterClient>(
    client: &C,
    namespace: &str,
    job: &Job,
) -> Result<(), AppError> {
    match job {
        Job::TaskRun(tr) => client.cancel_task_run(namespace, &tr.name_any()).await?,
        Job::PipelineRun(pr) => client.cancel_pipeline_run(namespace, &pr.name_any()).await?,
    }
    info!(kind = %job.kind(), job = %job.name(), "🛑 Job cancellation requested");
    Ok(())
}

/// Child TaskRuns of a PipelineRun in the order the PipelineRun lists them.
/// Children that are already gone are skipped.
pub async fn child_task_runs<C: ClusterClient>(
    client: &C,
    pipeline_run: &PipelineRun,
) -> Result<Vec<TaskRun>, AppError> {
    let namespace = pipeline_run.namespace().unwrap_or_default();
    let references = pipeline_run
        .status
        .as_ref()
        .map(|s| s.child_references.as_slice())
        .unwrap_or_default();

    let mut children = Vec::with_capacity(references.len());
    for reference in references {
        if !reference.kind.is_empty() && reference.kind != KIND_TASK_RUN {
            continue;
        }
        if let Some(task_run) = client.get_task_run(&namespace, &reference.name).await? {
            children.push(task_run);
        }
    }
    Ok(children)
}

/// Pod a TaskRun runs in, if Tekton recorded one and it still exists.
pub async fn execution_pod<C: ClusterClient>(
    client: &C,
    task_run: &TaskRun,
) -> Result<Option<Pod>, AppError> {
    let Some(pod_name) = task_run.status.as_ref().and_then(|s| s.pod_name.as_deref()) else {
        return Ok(None);
    };
    let namespace = task_run.namespace().unwrap_or_default();
    client.get_pod(&namespace, pod_name).await
}
