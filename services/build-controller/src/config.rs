use std::{net::SocketAddr, path::PathBuf, time::Duration};

use build_core::{
    compiler::ExecutorKind,
    configs::{CompilerConfig, ContainerTemplate},
};
use config::{ConfigBuilder, ConfigError, Environment, File, builder::AsyncState};
use factory::factories::{kubernetes::KubernetesConfig, observability::ObservabilityConfig};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::info;
use utility::parse_value::parse_value;

use crate::{error::AppError, services::metrics::MetricLabel};

const DEFAULT_COMPLETION_BUCKETS: [f64; 10] =
    [50.0, 100.0, 150.0, 200.0, 250.0, 300.0, 350.0, 400.0, 450.0, 500.0];
const DEFAULT_ESTABLISH_BUCKETS: [f64; 10] = [0.0, 1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 15.0, 20.0, 30.0];
const DEFAULT_RAMPUP_BUCKETS: [f64; 10] = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];

fn default_server_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8383))
}

fn default_ctx_timeout() -> u64 {
    300
}

fn default_buildrun_executor() -> String {
    ExecutorKind::TaskRun.to_string()
}

fn default_vulnerability_count_limit() -> u32 {
    50
}

fn default_leader_election_namespace() -> String {
    "default".to_string()
}

fn default_lease_duration() -> u64 {
    15
}

fn default_renew_deadline() -> u64 {
    10
}

fn default_retry_period() -> u64 {
    2
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_server_address")]
    pub server_address: SocketAddr,
    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default = "default_ctx_timeout")]
    pub ctx_timeout: u64,
    #[serde(default = "default_buildrun_executor")]
    pub buildrun_executor: String,

    #[serde(default)]
    pub git_container_template: Option<String>,
    #[serde(default)]
    pub git_container_image: Option<String>,
    #[serde(default)]
    pub bundle_container_template: Option<String>,
    #[serde(default)]
    pub bundle_container_image: Option<String>,
    #[serde(default)]
    pub image_processing_container_template: Option<String>,
    #[serde(default)]
    pub image_processing_container_image: Option<String>,
    #[serde(default)]
    pub waiter_container_template: Option<String>,
    #[serde(default)]
    pub waiter_container_image: Option<String>,
    #[serde(default = "default_vulnerability_count_limit")]
    pub vulnerability_count_limit: u32,

    #[serde(default)]
    pub prometheus_br_comp_dur_buckets: Option<String>,
    #[serde(default)]
    pub prometheus_br_est_dur_buckets: Option<String>,
    #[serde(default)]
    pub prometheus_br_rampup_dur_buckets: Option<String>,
    #[serde(default)]
    pub prometheus_enabled_labels: Option<String>,

    #[serde(default)]
    pub build_controller_leader_election: bool,
    #[serde(default = "default_leader_election_namespace")]
    pub build_controller_leader_election_namespace: String,
    #[serde(default = "default_lease_duration")]
    pub build_controller_lease_duration: u64,
    #[serde(default = "default_renew_deadline")]
    pub build_controller_renew_deadline: u64,
    #[serde(default = "default_retry_period")]
    pub build_controller_retry_period: u64,

    #[serde(default)]
    pub build_max_concurrent_reconciles: usize,
    #[serde(default)]
    pub buildrun_max_concurrent_reconciles: usize,
    #[serde(default)]
    pub buildstrategy_max_concurrent_reconciles: usize,
    #[serde(default)]
    pub clusterbuildstrategy_max_concurrent_reconciles: usize,

    #[serde(default)]
    pub kube_api_qps: f64,
    #[serde(default)]
    pub kube_api_burst: u32,

    #[serde(default)]
    pub k8s_in_cluster: bool,
    #[serde(default)]
    pub k8s_config_path: Option<String>,
}

impl Config {
    pub async fn init(path: PathBuf) -> Result<Self, ConfigError> {
        let cfg = ConfigBuilder::<AsyncState>::default()
            .add_source(File::from(path).required(false))
            .add_source(Environment::default())
            .build()
            .await?;

        cfg.try_deserialize()
    }

    pub fn executor_kind(&self) -> Result<ExecutorKind, AppError> {
        Ok(self.buildrun_executor.parse()?)
    }

    pub fn ctx_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx_timeout)
    }

    /// Worker count of the BuildRun controller; zero means one.
    pub fn buildrun_workers(&self) -> usize {
        self.buildrun_max_concurrent_reconciles.max(1)
    }

    /// Worker count of the Build limit cleanup; zero means one.
    pub fn build_workers(&self) -> usize {
        self.build_max_concurrent_reconciles.max(1)
    }

    pub fn log_controller_limits(&self) {
        info!(
            build = self.build_workers(),
            buildrun = self.buildrun_workers(),
            buildstrategy = self.buildstrategy_max_concurrent_reconciles.max(1),
            clusterbuildstrategy = self.clusterbuildstrategy_max_concurrent_reconciles.max(1),
            "⚙️ Max concurrent reconciles"
        );
    }

    pub fn compiler_config(&self) -> Result<CompilerConfig, AppError> {
        let defaults = CompilerConfig::default();

        Ok(CompilerConfig {
            git_container_template: template(
                "GIT_CONTAINER_TEMPLATE",
                self.git_container_template.as_deref(),
                defaults.git_container_template,
            )?
            .with_image(self.git_container_image.clone()),
            bundle_container_template: template(
                "BUNDLE_CONTAINER_TEMPLATE",
                self.bundle_container_template.as_deref(),
                defaults.bundle_container_template,
            )?
            .with_image(self.bundle_container_image.clone()),
            image_processing_container_template: template(
                "IMAGE_PROCESSING_CONTAINER_TEMPLATE",
                self.image_processing_container_template.as_deref(),
                defaults.image_processing_container_template,
            )?
            .with_image(self.image_processing_container_image.clone()),
            waiter_container_template: template(
                "WAITER_CONTAINER_TEMPLATE",
                self.waiter_container_template.as_deref(),
                defaults.waiter_container_template,
            )?
            .with_image(self.waiter_container_image.clone()),
            vulnerability_count_limit: self.vulnerability_count_limit,
        })
    }

    pub fn completion_buckets(&self) -> Result<Vec<f64>, AppError> {
        buckets(
            "PROMETHEUS_BR_COMP_DUR_BUCKETS",
            self.prometheus_br_comp_dur_buckets.as_deref(),
            &DEFAULT_COMPLETION_BUCKETS,
        )
    }

    pub fn establish_buckets(&self) -> Result<Vec<f64>, AppError> {
        buckets(
            "PROMETHEUS_BR_EST_DUR_BUCKETS",
            self.prometheus_br_est_dur_buckets.as_deref(),
            &DEFAULT_ESTABLISH_BUCKETS,
        )
    }

    pub fn rampup_buckets(&self) -> Result<Vec<f64>, AppError> {
        buckets(
            "PROMETHEUS_BR_RAMPUP_DUR_BUCKETS",
            self.prometheus_br_rampup_dur_buckets.as_deref(),
            &DEFAULT_RAMPUP_BUCKETS,
        )
    }

    /// Labels the duration metrics carry. Unknown names are rejected.
    pub fn enabled_labels(&self) -> Result<Vec<MetricLabel>, AppError> {
        let Some(raw) = self
            .prometheus_enabled_labels
            .as_deref()
            .filter(|r| !r.trim().is_empty())
        else {
            return Ok(vec![]);
        };

        let names: Vec<String> = parse_env("PROMETHEUS_ENABLED_LABELS", raw)?;
        names
            .iter()
            .map(|name| {
                name.parse().map_err(|_| {
                    AppError::InvalidConfig(format!(
                        "PROMETHEUS_ENABLED_LABELS: unknown label {name:?}"
                    ))
                })
            })
            .collect()
    }
}

impl KubernetesConfig for Config {
    fn k8s_in_cluster(&self) -> bool {
        self.k8s_in_cluster
    }

    fn k8s_config_path(&self) -> Option<String> {
        self.k8s_config_path.clone().filter(|p| !p.is_empty())
    }
}

fn parse_env<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, AppError> {
    parse_value(raw).ok_or_else(|| AppError::InvalidConfig(format!("{key}: cannot parse {raw:?}")))
}

fn template(
    key: &str,
    raw: Option<&str>,
    default: ContainerTemplate,
) -> Result<ContainerTemplate, AppError> {
    match raw.filter(|r| !r.trim().is_empty()) {
        Some(raw) => parse_env(key, raw),
        None => Ok(default),
    }
}

fn buckets(key: &str, raw: Option<&str>, default: &[f64]) -> Result<Vec<f64>, AppError> {
    match raw.filter(|r| !r.trim().is_empty()) {
        Some(raw) => parse_env(key, raw),
        None => Ok(default.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        serde_json::from_str("{}").unwrap()
    }

    #[test]
    fn everything_has_a_default() {
        let cfg = config();

        assert_eq!(cfg.server_address.port(), 8383);
        assert_eq!(cfg.ctx_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.executor_kind().unwrap(), ExecutorKind::TaskRun);
        assert_eq!(cfg.buildrun_workers(), 1);
        assert_eq!(cfg.build_workers(), 1);
        assert_eq!(cfg.compiler_config().unwrap(), CompilerConfig::default());
        assert_eq!(cfg.establish_buckets().unwrap(), DEFAULT_ESTABLISH_BUCKETS);
        assert!(cfg.enabled_labels().unwrap().is_empty());
    }

    #[test]
    fn unknown_executor_fails_startup() {
        let mut cfg = config();
        cfg.buildrun_executor = "Deployment".to_string();

        assert_eq!(
            cfg.executor_kind().unwrap_err().to_string(),
            "unsupported BuildrunExecutor: Deployment"
        );
    }

    #[test]
    fn templates_and_images_are_layered() {
        let mut cfg = config();
        cfg.git_container_template = Some(
            r#"{"image":"quay.io/shipwright/git:v1","command":["/ko-app/git"],"args":["--verbose"]}"#
                .to_string(),
        );
        cfg.waiter_container_image = Some("quay.io/shipwright/waiter:v2".to_string());

        let compiler = cfg.compiler_config().unwrap();

        assert_eq!(compiler.git_container_template.image, "quay.io/shipwright/git:v1");
        assert_eq!(compiler.git_container_template.args, ["--verbose"]);
        assert_eq!(compiler.waiter_container_template.image, "quay.io/shipwright/waiter:v2");
        assert_eq!(compiler.waiter_container_template.args, ["start"]);
    }

    #[test]
    fn buckets_and_labels_come_from_csv() {
        let mut cfg = config();
        cfg.prometheus_br_comp_dur_buckets = Some("10,20,40".to_string());
        cfg.prometheus_enabled_labels = Some("namespace,buildstrategy".to_string());

        assert_eq!(cfg.completion_buckets().unwrap(), [10.0, 20.0, 40.0]);
        assert_eq!(
            cfg.enabled_labels().unwrap(),
            [MetricLabel::Namespace, MetricLabel::BuildStrategy]
        );

        cfg.prometheus_enabled_labels = Some("namespace,pod".to_string());
        assert!(cfg.enabled_labels().is_err());
    }
}
