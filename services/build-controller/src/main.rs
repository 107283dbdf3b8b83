pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, net::SocketAddr};

use factory::factories::{kubernetes::Kubernetes, observability::Observability};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tracing::{error, info};
use utility::shutdown_signal::shutdown_signal;

use crate::{
    config::Config,
    error::AppError,
    services::{
        cluster::KubeClusterClient,
        event_watcher::{WatchQueues, event_watcher},
        leader_election::{LeaderElection, LeaseTimings},
        metrics::{BucketConfig, BuildMetrics},
        reconciler::{Reconciler, run_worker},
        retention::{RetentionCleaner, run_limit_worker, run_ttl_worker},
        throttle::Throttle,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // These are baked at COMPILE time
    let cargo_manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let cargo_crate_name = env!("CARGO_CRATE_NAME");
    let cargo_pkg_name = env!("CARGO_PKG_NAME");
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    let env_path = cargo_manifest_dir.join(".env");

    // Load service-specific .env
    dotenvy::from_path(&env_path).ok();
    // Load workspace root .env as fallback
    dotenvy::dotenv().ok();

    let path = env::var("CONFIG").unwrap_or("config.json".to_string());
    let full_path = cargo_manifest_dir.join(path);
    let cfg = Config::init(full_path).await?;

    let _guard = Observability::init(
        cargo_crate_name.to_string(),
        cargo_pkg_version.to_string(),
        &cfg.observability,
    )
    .await;

    let executor_kind = cfg.executor_kind()?;
    let compiler_config = cfg.compiler_config()?;
    cfg.log_controller_limits();
    info!(executor = %executor_kind, "⚙️ BuildRun job backend");

    let kubernetes = Kubernetes::new(&cfg).await?;

    let mut registry = Registry::default();
    let metrics = BuildMetrics::new(
        &mut registry,
        BucketConfig {
            completion: cfg.completion_buckets()?,
            establish: cfg.establish_buckets()?,
            rampup: cfg.rampup_buckets()?,
        },
        cfg.enabled_labels()?,
    );
    let registry = Arc::new(registry);

    let throttle = Throttle::new(cfg.kube_api_qps, cfg.kube_api_burst);
    let cluster = KubeClusterClient::new(kubernetes.client.clone(), throttle);
    let cleaner = Arc::new(RetentionCleaner::new(cluster.clone()));
    let reconciler = Arc::new(Reconciler::new(
        cluster,
        executor_kind,
        compiler_config,
        metrics,
    ));
    let queues = WatchQueues::default();

    let mut set = JoinSet::new();

    // health stays reachable while waiting for the lease
    set.spawn(start_health_server(
        cargo_pkg_name,
        cargo_pkg_version,
        cfg.server_address,
        Arc::clone(&registry),
    ));

    if cfg.build_controller_leader_election {
        let election = LeaderElection::new(
            kubernetes.client.clone(),
            &cfg.build_controller_leader_election_namespace,
            LeaseTimings {
                lease_duration: Duration::from_secs(cfg.build_controller_lease_duration),
                renew_deadline: Duration::from_secs(cfg.build_controller_renew_deadline),
                retry_period: Duration::from_secs(cfg.build_controller_retry_period),
            },
        );
        info!(identity = %election.identity(), "🗳️ Leader election enabled");

        tokio::select! {
            result = election.acquire() => result?,
            _ = shutdown_signal() => {
                info!("🛑 Shutdown signal received before leadership was acquired");
                set.shutdown().await;
                return Ok(());
            }
        }
        set.spawn(election.hold());
    }

    set.spawn(event_watcher(kubernetes.client.clone(), queues.clone()));
    for worker in 0..cfg.buildrun_workers() {
        set.spawn(run_worker(
            worker,
            Arc::clone(&reconciler),
            Arc::clone(&queues.buildruns),
            cfg.ctx_timeout(),
        ));
        set.spawn(run_ttl_worker(
            worker,
            Arc::clone(&cleaner),
            Arc::clone(&queues.ttl),
            cfg.ctx_timeout(),
        ));
    }
    for worker in 0..cfg.build_workers() {
        set.spawn(run_limit_worker(
            worker,
            Arc::clone(&cleaner),
            Arc::clone(&queues.limits),
            cfg.ctx_timeout(),
        ));
    }

    info!("✅ All background tasks started");

    // Unified shutdown logic
    tokio::select! {
        _ = shutdown_signal() => {
            info!("🛑 Shutdown signal received");
            queues.shutdown().await;
            set.shutdown().await;
        }
        Some(result) = set.join_next() => {
            match result {
                Ok(Ok(())) => error!("A background task exited unexpectedly!"),
                Ok(Err(e)) => error!("Task failed: {}", e),
                Err(e) => error!("Task panic: {}", e),
            }
            queues.shutdown().await;
            set.shutdown().await;
        }
    }

    info!("👋 Shutting down gracefully...");

    Ok(())
}

// Health checks and the metrics endpoint
async fn start_health_server(
    cargo_pkg_name: &'static str,
    cargo_pkg_version: &'static str,
    addr: SocketAddr,
    registry: Arc<Registry>,
) -> Result<(), AppError> {
    let app = app::app(cargo_pkg_name, cargo_pkg_version, registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🚀 {} service running at {:#?}", cargo_pkg_name, addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
