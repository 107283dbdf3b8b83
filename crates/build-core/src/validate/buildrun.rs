use kube::ResourceExt;

use crate::conditions::{
    BUILD_RUN_AMBIGUOUS_BUILD, BUILD_RUN_BUILD_FIELD_OVERRIDE_FORBIDDEN, BUILD_RUN_NAME_INVALID,
    BUILD_RUN_NO_REF_OR_SPEC,
};
use crate::crds::buildrun::BuildRun;
use crate::validate::{ValidationError, ValidationResult, label_value_errors};

fn override_forbidden(field: &str) -> ValidationError {
    ValidationError::new(
        BUILD_RUN_BUILD_FIELD_OVERRIDE_FORBIDDEN,
        format!("cannot use '{field}' override and 'buildSpec' simultaneously"),
    )
}

/// Rejects names that cannot be used as label values and field combinations
/// that make no sense together.
pub fn buildrun_fields(buildrun: &BuildRun) -> ValidationResult {
    let errors = label_value_errors(&buildrun.name_any());
    if !errors.is_empty() {
        return Err(ValidationError::new(BUILD_RUN_NAME_INVALID, errors.join(", ")));
    }

    let spec = &buildrun.spec;
    match (&spec.build.name, &spec.build.spec) {
        (None, None) => Err(ValidationError::new(
            BUILD_RUN_NO_REF_OR_SPEC,
            "no build referenced or specified, either 'name' or 'spec' has to be set",
        )),
        (Some(_), Some(_)) => Err(ValidationError::new(
            BUILD_RUN_AMBIGUOUS_BUILD,
            "fields 'name' and 'spec' are mutually exclusive",
        )),
        (None, Some(_)) => {
            if spec.output.is_some() {
                return Err(override_forbidden("output"));
            }
            if !spec.param_values.is_empty() {
                return Err(override_forbidden("paramValues"));
            }
            if !spec.env.is_empty() {
                return Err(override_forbidden("env"));
            }
            if spec.timeout.is_some() {
                return Err(override_forbidden("timeout"));
            }
            Ok(())
        }
        (Some(_), None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::build::{BuildSpec, ParamValue};
    use crate::crds::buildrun::{BuildRunSpec, ReferencedBuild};

    fn embedded() -> BuildRunSpec {
        BuildRunSpec {
            build: ReferencedBuild {
                name: None,
                spec: Some(Box::new(BuildSpec::default())),
            },
            ..Default::default()
        }
    }

    #[test]
    fn needs_exactly_one_build_source() {
        let err = buildrun_fields(&BuildRun::new("run", BuildRunSpec::default())).unwrap_err();
        assert_eq!(err.reason, BUILD_RUN_NO_REF_OR_SPEC);

        let mut spec = embedded();
        spec.build.name = Some("buildah".to_string());
        let err = buildrun_fields(&BuildRun::new("run", spec)).unwrap_err();
        assert_eq!(err.reason, BUILD_RUN_AMBIGUOUS_BUILD);
    }

    #[test]
    fn embedded_spec_forbids_overrides() {
        let mut spec = embedded();
        spec.param_values = vec![ParamValue::literal("sleep-time", "1")];

        let err = buildrun_fields(&BuildRun::new("run", spec)).unwrap_err();

        assert_eq!(err.reason, BUILD_RUN_BUILD_FIELD_OVERRIDE_FORBIDDEN);
        assert_eq!(
            err.message,
            "cannot use 'paramValues' override and 'buildSpec' simultaneously"
        );
    }

    #[test]
    fn invalid_name_is_rejected() {
        let spec = BuildRunSpec {
            build: ReferencedBuild {
                name: Some("buildah".to_string()),
                spec: None,
            },
            ..Default::default()
        };
        let err = buildrun_fields(&BuildRun::new(&"r".repeat(70), spec.clone())).unwrap_err();
        assert_eq!(err.reason, BUILD_RUN_NAME_INVALID);

        assert!(buildrun_fields(&BuildRun::new("buildah-run-1", spec)).is_ok());
    }
}
