//! Single active controller per cluster, coordinated through a
//! `coordination.k8s.io/v1` Lease.

use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
use rand::{Rng, distr::Alphanumeric};
use tracing::{debug, error, info, warn};

use crate::error::AppError;

pub const LEASE_NAME: &str = "build-controller-lock";

#[derive(Debug, Clone, Copy)]
pub struct LeaseTimings {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Pod hostname plus a random suffix, so two controllers sharing a hostname
/// never both believe they hold the lease.
pub fn holder_identity() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "build-controller".to_string());
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();

    format!("{hostname}_{suffix}")
}

fn micro_time(time: DateTime<Utc>) -> Option<MicroTime> {
    let raw = time.to_rfc3339_opts(SecondsFormat::Micros, true);
    serde_json::from_value(serde_json::Value::String(raw)).ok()
}

fn micro_time_to_utc(time: &MicroTime) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(raw.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Whether `identity` may take or keep the lease described by `spec` at `now`.
pub fn can_acquire(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };

    match spec.holder_identity.as_deref() {
        None | Some("") => return true,
        Some(holder) if holder == identity => return true,
        Some(_) => {}
    }

    let renewed = spec.renew_time.as_ref().and_then(micro_time_to_utc);
    let duration = TimeDelta::seconds(spec.lease_duration_seconds.unwrap_or_default().into());
    match renewed {
        Some(renewed) => renewed + duration < now,
        None => true,
    }
}

/// The `LeaseSpec` written when `identity` takes or renews the lease.
fn next_spec(
    current: Option<&LeaseSpec>,
    identity: &str,
    timings: &LeaseTimings,
    now: DateTime<Utc>,
) -> LeaseSpec {
    let held = current.is_some_and(|s| s.holder_identity.as_deref() == Some(identity));
    let transitions = current
        .and_then(|s| s.lease_transitions)
        .unwrap_or_default();
    let now = micro_time(now);

    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: i32::try_from(timings.lease_duration.as_secs()).ok(),
        acquire_time: if held {
            current.and_then(|s| s.acquire_time.clone())
        } else {
            now.clone()
        },
        renew_time: now,
        lease_transitions: Some(if held || current.is_none() {
            transitions
        } else {
            transitions + 1
        }),
        ..Default::default()
    }
}

pub struct LeaderElection {
    api: Api<Lease>,
    identity: String,
    timings: LeaseTimings,
}

impl LeaderElection {
    pub fn new(client: Client, namespace: &str, timings: LeaseTimings) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity: holder_identity(),
            timings,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One attempt to take or renew the lease. `Ok(false)` when another
    /// controller holds it or won a concurrent write.
    #[tracing::instrument(
        name = "leader_election.renew",
        skip_all,
        fields(identity = %self.identity),
        err
    )]
    pub async fn try_acquire_or_renew(&self) -> Result<bool, AppError> {
        let now = Utc::now();

        let written = match self.api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(next_spec(None, &self.identity, &self.timings, now)),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
            Some(mut lease) => {
                if !can_acquire(lease.spec.as_ref(), &self.identity, now) {
                    debug!(
                        holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref()),
                        "Lease held by another controller"
                    );
                    return Ok(false);
                }
                lease.spec = Some(next_spec(
                    lease.spec.as_ref(),
                    &self.identity,
                    &self.timings,
                    now,
                ));
                self.api
                    .replace(LEASE_NAME, &PostParams::default(), &lease)
                    .await
            }
        };

        match written {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until the lease is ours.
    pub async fn acquire(&self) -> Result<(), AppError> {
        info!(lease = LEASE_NAME, identity = %self.identity, "🗳️ Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "👑 Leadership acquired");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "⚠️ Failed to acquire lease"),
            }
            tokio::time::sleep(self.timings.retry_period).await;
        }
    }

    /// Renews the lease every retry period. Returns an error once no renewal
    /// succeeded within the renew deadline, which must end the process.
    pub async fn hold(self) -> Result<(), AppError> {
        let mut renewed = Instant::now();
        loop {
            tokio::time::sleep(self.timings.retry_period).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => renewed = Instant::now(),
                Ok(false) => warn!(identity = %self.identity, "⚠️ Lease taken over"),
                Err(e) => warn!(error = %e, "⚠️ Failed to renew lease"),
            }

            if renewed.elapsed() > self.timings.renew_deadline {
                error!(identity = %self.identity, "❌ Leadership lost");
                return Err(AppError::LeaderElectionLost(format!(
                    "lease {LEASE_NAME} not renewed within {:?}",
                    self.timings.renew_deadline
                )));
            }
        }
    }
}
