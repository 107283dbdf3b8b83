use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use tracing::info;

use crate::factories::kubernetes::{Kubernetes, error::KubernetesError};

/// Where the controller finds its cluster.
pub trait KubernetesConfig {
    fn k8s_in_cluster(&self) -> bool;
    fn k8s_config_path(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    InCluster,
    Kubeconfig(String),
    /// Kubeconfig from `KUBECONFIG` or `~/.kube/config`, else in-cluster.
    Inferred,
}

impl ConfigSource {
    pub fn from_config<T: KubernetesConfig>(config: &T) -> Self {
        if config.k8s_in_cluster() {
            return Self::InCluster;
        }
        match config.k8s_config_path() {
            Some(path) if !path.is_empty() => Self::Kubeconfig(path),
            _ => Self::Inferred,
        }
    }

    async fn load(&self) -> Result<Config, KubernetesError> {
        Ok(match self {
            Self::InCluster => Config::incluster()?,
            Self::Kubeconfig(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            Self::Inferred => Config::infer().await?,
        })
    }
}

impl Kubernetes {
    pub async fn new<T: KubernetesConfig>(config: &T) -> Result<Self, KubernetesError> {
        let source = ConfigSource::from_config(config);
        let kube_config = source.load().await?;

        info!(
            source = ?source,
            cluster_url = %kube_config.cluster_url,
            "✅ Connected to Kubernetes"
        );
        let client = Client::try_from(kube_config)?;

        Ok(Self { client })
    }
}
