//! Deletes finished BuildRuns once their retention runs out: a TTL after
//! completion, or the succeeded and failed limits of their Build.

use std::{sync::Arc, time::Duration};

use build_core::{
    crds::{BuildRun, ConditionStatus, build::BuildRetention, common::time_to_utc},
    labels,
};
use chrono::{DateTime, TimeDelta, Utc};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::{
    error::AppError,
    services::{
        cluster::ClusterClient,
        work_queue::{ObjectKey, WorkQueue},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// How a BuildRun ended, `None` while it runs.
pub fn outcome(buildrun: &BuildRun) -> Option<Outcome> {
    match buildrun.succeeded_condition()?.status {
        ConditionStatus::True => Some(Outcome::Succeeded),
        ConditionStatus::False => Some(Outcome::Failed),
        ConditionStatus::Unknown => None,
    }
}

/// The TTL of `retention` that applies to `outcome`.
pub fn ttl_for(retention: Option<&BuildRetention>, outcome: Outcome) -> Option<&str> {
    let retention = retention?;
    match outcome {
        Outcome::Succeeded => retention.ttl_after_succeeded.as_deref(),
        Outcome::Failed => retention.ttl_after_failed.as_deref(),
    }
}

/// TTL of a finished BuildRun. Its own retention wins over the one of the
/// Build spec it ran with.
pub fn ttl(buildrun: &BuildRun) -> Option<&str> {
    let outcome = outcome(buildrun)?;
    ttl_for(buildrun.spec.retention.as_ref(), outcome).or_else(|| {
        let build_spec = buildrun.status_ref()?.build_spec.as_ref()?;
        ttl_for(build_spec.retention.as_ref(), outcome)
    })
}

/// Durations the API server stores, like `1h30m0s` or `10m`.
pub fn parse_ttl(raw: &str) -> Option<Duration> {
    humantime::parse_duration(raw).ok()
}

/// The first `runs.len() - limit` runs by creation time.
fn oldest_beyond(mut runs: Vec<BuildRun>, limit: u32) -> Vec<BuildRun> {
    let excess = runs.len().saturating_sub(limit as usize);
    runs.sort_by_key(|br| br.metadata.creation_timestamp.as_ref().and_then(time_to_utc));
    runs.truncate(excess);
    runs
}

pub struct RetentionCleaner<C> {
    client: C,
}

impl<C: ClusterClient> RetentionCleaner<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Deletes the BuildRun of `key` once its TTL has passed at `now`. While
    /// it has not, returns the time left.
    #[tracing::instrument(
        name = "retention.ttl",
        skip_all,
        fields(namespace = %key.namespace, name = %key.name),
        err
    )]
    pub async fn expire(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, AppError> {
        let Some(buildrun) = self.client.get_buildrun(&key.namespace, &key.name).await? else {
            debug!("BuildRun is gone, nothing to expire");
            return Ok(None);
        };

        let Some(raw) = ttl(&buildrun) else {
            return Ok(None);
        };
        let Some(ttl) = parse_ttl(raw) else {
            warn!(ttl = raw, "⚠️ Ignoring retention TTL that is not a duration");
            return Ok(None);
        };
        let Some(completed) = buildrun.status_ref().and_then(|s| s.completion_time) else {
            return Ok(None);
        };
        let Some(expiry) = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| completed.checked_add_signed(ttl))
        else {
            return Ok(None);
        };

        if expiry > now {
            return Ok((expiry - now).to_std().ok());
        }

        info!("🗑️ Deleting BuildRun as its TTL has been reached");
        self.client
            .delete_buildrun(&key.namespace, &key.name)
            .await?;
        Ok(None)
    }

    /// Deletes the oldest succeeded and failed BuildRuns of the Build of `key`
    /// beyond its limits and returns how many went.
    #[tracing::instrument(
        name = "retention.limits",
        skip_all,
        fields(namespace = %key.namespace, build = %key.name),
        err
    )]
    pub async fn enforce_limits(&self, key: &ObjectKey) -> Result<usize, AppError> {
        let Some(build) = self.client.get_build(&key.namespace, &key.name).await? else {
            debug!("Build is gone, nothing to clean up");
            return Ok(0);
        };
        let Some(retention) = build
            .spec
            .retention
            .filter(|r| r.succeeded_limit.is_some() || r.failed_limit.is_some())
        else {
            return Ok(0);
        };

        let selector = format!("{}={}", labels::BUILD_NAME, key.name);
        let buildruns = self
            .client
            .list_buildruns(&key.namespace, &selector)
            .await?;

        let (mut succeeded, mut failed) = (Vec::new(), Vec::new());
        for buildrun in buildruns {
            match outcome(&buildrun) {
                Some(Outcome::Succeeded) => succeeded.push(buildrun),
                Some(Outcome::Failed) => failed.push(buildrun),
                None => {}
            }
        }

        let mut deleted = 0;
        for (outcome, runs, limit) in [
            (Outcome::Succeeded, succeeded, retention.succeeded_limit),
            (Outcome::Failed, failed, retention.failed_limit),
        ] {
            let Some(limit) = limit else {
                continue;
            };
            for buildrun in oldest_beyond(runs, limit) {
                info!(
                    buildrun = %buildrun.name_any(),
                    ?outcome,
                    "🗑️ Deleting BuildRun as the cleanup limit has been reached"
                );
                self.client
                    .delete_buildrun(&key.namespace, &buildrun.name_any())
                    .await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Checks the TTL of queued BuildRuns, coming back when one is still alive.
pub async fn run_ttl_worker<C: ClusterClient>(
    worker: usize,
    cleaner: Arc<RetentionCleaner<C>>,
    queue: Arc<WorkQueue>,
    deadline: Duration,
) -> Result<(), AppError> {
    debug!(worker, "👷 TTL cleanup worker started");

    while let Some(key) = queue.get().await {
        match tokio::time::timeout(deadline, cleaner.expire(&key, Utc::now())).await {
            Ok(Ok(remaining)) => {
                queue.forget(&key).await;
                if let Some(remaining) = remaining {
                    queue.add_after(key.clone(), remaining);
                }
            }
            Ok(Err(e)) => {
                error!(%key, error = %e, "❌ TTL cleanup failed");
                queue.add_rate_limited(key.clone()).await;
            }
            Err(_) => {
                warn!(%key, ?deadline, "⏱️ TTL cleanup exceeded its deadline");
                queue.add_rate_limited(key.clone()).await;
            }
        }
        queue.done(&key).await;
    }

    debug!(worker, "TTL cleanup worker stopped");
    Ok(())
}

/// Enforces the limits of queued Builds.
pub async fn run_limit_worker<C: ClusterClient>(
    worker: usize,
    cleaner: Arc<RetentionCleaner<C>>,
    queue: Arc<WorkQueue>,
    deadline: Duration,
) -> Result<(), AppError> {
    debug!(worker, "👷 Limit cleanup worker started");

    while let Some(key) = queue.get().await {
        match tokio::time::timeout(deadline, cleaner.enforce_limits(&key)).await {
            Ok(Ok(deleted)) => {
                if deleted > 0 {
                    debug!(%key, deleted, "🧹 BuildRuns over the limit removed");
                }
                queue.forget(&key).await;
            }
            Ok(Err(e)) => {
                error!(%key, error = %e, "❌ Limit cleanup failed");
                queue.add_rate_limited(key.clone()).await;
            }
            Err(_) => {
                warn!(%key, ?deadline, "⏱️ Limit cleanup exceeded its deadline");
                queue.add_rate_limited(key.clone()).await;
            }
        }
        queue.done(&key).await;
    }

    debug!(worker, "Limit cleanup worker stopped");
    Ok(())
}
