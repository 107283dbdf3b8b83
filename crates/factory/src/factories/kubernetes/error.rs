use thiserror::Error;

#[derive(Error, Debug)]
pub enum KubernetesError {
    #[error("Kube error, {0}")]
    KubeError(#[from] kube::Error),
    #[error("in-cluster config unavailable, {0}")]
    InClusterError(#[from] kube_client::config::InClusterError),
    #[error("kubeconfig unreadable, {0}")]
    KubeconfigError(#[from] kube_client::config::KubeconfigError),
    #[error("cluster config could not be inferred, {0}")]
    InferConfigError(#[from] kube_client::config::InferConfigError),
}
