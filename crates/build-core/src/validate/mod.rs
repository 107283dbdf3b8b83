//! Checks that turn a BuildRun into a terminal failure before any job exists.

mod buildrun;
mod names;
mod params;
mod spec;

pub use buildrun::buildrun_fields;
pub use names::{is_dns1123_subdomain, label_value_errors};
pub use params::{build_parameters, buildrun_parameters, is_system_reserved_parameter};
pub use spec::{embedded_build_spec, runtime_class_name, step_resources};

/// A failed check, carried as the machine reason and human message the
/// BuildRun condition will show.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ValidationError {
    pub reason: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

pub type ValidationResult = Result<(), ValidationError>;
