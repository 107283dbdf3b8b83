pub mod error;
pub mod implementation;

pub use implementation::{ConfigSource, KubernetesConfig};

use kube::Client;

#[derive(Clone)]
pub struct Kubernetes {
    pub client: Client,
}
