//! Which watch events are worth a reconcile.

use build_core::crds::{Build, BuildRun, ConditionStatus};

use crate::services::{
    backend::Job,
    retention::{self, parse_ttl},
};

/// New BuildRuns are only interesting while nobody has started or finished them.
pub fn buildrun_created(buildrun: &BuildRun) -> bool {
    buildrun
        .status_ref()
        .is_none_or(|s| s.executor.is_none() && s.completion_time.is_none())
}

/// The only spec change a running BuildRun reacts to is a cancel request.
pub fn buildrun_updated(old: &BuildRun, new: &BuildRun) -> bool {
    !old.is_canceled() && new.is_canceled()
}

pub fn job_updated(old: &Job, new: &Job) -> bool {
    if old.start_time().is_none() && new.start_time().is_some() {
        return true;
    }

    match (old.condition(), new.condition()) {
        (None, Some(_)) => true,
        (_, Some(new)) if new.status == ConditionStatus::False => true,
        (Some(old), Some(new)) => {
            old.status != new.status || old.reason != new.reason || old.message != new.message
        }
        _ => false,
    }
}

/// A job deleted before it completed leaves its BuildRun stranded.
pub fn job_deleted(job: &Job) -> bool {
    job.completion_time().is_none()
}

/// A finished BuildRun that carries a TTL, its own or its Build's.
pub fn ttl_applies(buildrun: &BuildRun) -> bool {
    retention::ttl(buildrun).is_some()
}

/// A BuildRun that just finished with a TTL, or a finished one whose own TTL
/// was introduced or lowered.
pub fn ttl_updated(old: &BuildRun, new: &BuildRun) -> bool {
    let Some(outcome) = retention::outcome(new) else {
        return false;
    };
    if retention::outcome(old).is_none() {
        return ttl_applies(new);
    }

    let own = |br: &BuildRun| {
        retention::ttl_for(br.spec.retention.as_ref(), outcome).map(parse_ttl)
    };
    match (own(old), own(new)) {
        (None, Some(_)) => true,
        (Some(Some(old)), Some(Some(new))) => new < old,
        _ => false,
    }
}

/// A BuildRun of a referenced Build that just finished, which may push the
/// Build over its limits.
pub fn buildrun_finished(old: &BuildRun, new: &BuildRun) -> bool {
    !new.build_name().is_empty()
        && retention::outcome(old).is_none()
        && retention::outcome(new).is_some()
}

fn limits(build: &Build) -> (Option<u32>, Option<u32>) {
    build
        .spec
        .retention
        .as_ref()
        .map(|r| (r.succeeded_limit, r.failed_limit))
        .unwrap_or_default()
}

fn tightened(old: Option<u32>, new: Option<u32>) -> bool {
    match (old, new) {
        (None, Some(_)) => true,
        (Some(old), Some(new)) => new < old,
        _ => false,
    }
}

pub fn build_limits_set(build: &Build) -> bool {
    let (succeeded, failed) = limits(build);
    succeeded.is_some() || failed.is_some()
}

/// Limits that appeared or went down.
pub fn build_limits_updated(old: &Build, new: &Build) -> bool {
    let (old_succeeded, old_failed) = limits(old);
    let (new_succeeded, new_failed) = limits(new);
    tightened(old_succeeded, new_succeeded) || tightened(old_failed, new_failed)
}
