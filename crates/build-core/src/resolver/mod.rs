//! Override resolution between a Build, a BuildRun and a strategy.
//!
//! Everything here is pure and deterministic for the same inputs.

mod env;
mod error;
mod params;
mod resources;
mod scheduling;
mod volumes;

pub use env::merge_env_vars;
pub use error::ResolveError;
pub use params::override_params;
pub use resources::step_resource_overrides;
pub use scheduling::{
    effective_ca_bundle, effective_output_image, effective_output_insecure,
    effective_push_secret, effective_runtime_class_name, effective_scheduler_name,
    effective_timeout, merge_maps, merge_tolerations, pod_template,
};
pub use volumes::resolve_volumes;
