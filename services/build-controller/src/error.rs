use build_core::compiler::UnsupportedExecutor;
use factory::factories::{
    kubernetes::error::KubernetesError, observability::error::ObservabilityError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Kube error, {0}")]
    KubeError(#[from] kube::Error),

    #[error("Kubernetes error, {0}")]
    KubernetesError(#[from] KubernetesError),

    #[error("Observability error, {0}")]
    ObservabilityError(#[from] ObservabilityError),

    #[error("Serde json error, {0}")]
    SerdejsonError(#[from] serde_json::Error),

    #[error("IO error, {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config error, {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("{0}")]
    UnsupportedExecutor(#[from] UnsupportedExecutor),

    #[error("Invalid configuration, {0}")]
    InvalidConfig(String),

    /// A precondition the cluster will eventually satisfy, retried with backoff.
    #[error("{0}")]
    NotReady(String),

    /// The BuildRun was failed or canceled but writing that to its status
    /// did not succeed, so the decision has to be taken again.
    #[error("failed to update client status: {0}")]
    ClientStatusUpdate(Box<AppError>),

    #[error("Leader election lost, {0}")]
    LeaderElectionLost(String),

    #[error("Internal server error, {0}")]
    InternalServerError(String),
}
