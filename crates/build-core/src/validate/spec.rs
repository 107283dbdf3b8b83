use crate::conditions::{
    BUILD_REGISTRATION_FAILED, RUNTIME_CLASS_NAME_NOT_VALID, UNDEFINED_STEP_RESOURCE,
    VOLUME_NOT_OVERRIDABLE,
};
use crate::crds::build::{BuildSpec, BuildVolume, SourceType, StepResourceOverride};
use crate::crds::strategy::{ResolvedStrategy, Step};
use crate::validate::{ValidationError, ValidationResult, build_parameters, is_dns1123_subdomain};

pub fn runtime_class_name(name: Option<&str>) -> ValidationResult {
    match name.map(is_dns1123_subdomain) {
        Some(Err(errors)) => Err(ValidationError::new(
            RUNTIME_CLASS_NAME_NOT_VALID,
            format!("RuntimeClassName not valid: {}", errors.join(", ")),
        )),
        _ => Ok(()),
    }
}

pub fn step_resources(steps: &[Step], overrides: &[StepResourceOverride]) -> ValidationResult {
    match overrides
        .iter()
        .find(|o| !steps.iter().any(|s| s.name == o.name))
    {
        Some(unknown) => Err(ValidationError::new(
            UNDEFINED_STEP_RESOURCE,
            format!(
                "stepResources references step {:?} which does not exist in the build strategy",
                unknown.name
            ),
        )),
        None => Ok(()),
    }
}

fn volumes(strategy: &ResolvedStrategy, volumes: &[BuildVolume]) -> ValidationResult {
    for volume in volumes {
        let declared = strategy
            .spec
            .volumes
            .iter()
            .find(|v| v.volume.name == volume.volume.name);
        if declared.is_some_and(|v| !v.is_overridable()) {
            return Err(ValidationError::new(
                VOLUME_NOT_OVERRIDABLE,
                format!("Volume {:?} is not overridable in the Strategy", volume.volume.name),
            ));
        }
    }
    Ok(())
}

fn source(spec: &BuildSpec) -> ValidationResult {
    let Some(source) = &spec.source else {
        return Ok(());
    };

    let problem = match source.type_ {
        SourceType::Git => match &source.git {
            None => Some("source type Git requires the 'git' field".to_string()),
            Some(git) if git.url.is_empty() => Some("git source URL must be informed".to_string()),
            Some(_) if source.oci_artifact.is_some() => {
                Some("source type Git cannot be combined with 'ociArtifact'".to_string())
            }
            Some(_) => None,
        },
        SourceType::Oci => match &source.oci_artifact {
            None => Some("source type OCI requires the 'ociArtifact' field".to_string()),
            Some(oci) if oci.image.is_empty() => {
                Some("OCI artifact image must be informed".to_string())
            }
            Some(_) if source.git.is_some() => {
                Some("source type OCI cannot be combined with 'git'".to_string())
            }
            Some(_) => None,
        },
        SourceType::Local => (source.git.is_some() || source.oci_artifact.is_some())
            .then(|| "source type Local cannot be combined with 'git' or 'ociArtifact'".to_string()),
    };

    match problem {
        Some(message) => Err(ValidationError::new(BUILD_REGISTRATION_FAILED, message)),
        None => Ok(()),
    }
}

/// In-process registration of a Build spec embedded in a BuildRun.
pub fn embedded_build_spec(spec: &BuildSpec, strategy: &ResolvedStrategy) -> ValidationResult {
    if spec.strategy.name.is_empty() {
        return Err(ValidationError::new(
            BUILD_REGISTRATION_FAILED,
            "the strategy reference must have a name",
        ));
    }
    if spec.output.image.is_empty() {
        return Err(ValidationError::new(
            BUILD_REGISTRATION_FAILED,
            "the output image must be specified",
        ));
    }

    source(spec)?;
    build_parameters(&strategy.spec.parameters, &spec.param_values)?;
    volumes(strategy, &spec.volumes)?;
    runtime_class_name(spec.runtime_class_name.as_deref())?;
    step_resources(&strategy.spec.steps, &spec.step_resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::build::{Git, Image, Source, StrategyRef};
    use crate::crds::strategy::{StrategySpec, StrategyVolume};

    fn strategy() -> ResolvedStrategy {
        ResolvedStrategy {
            kind: "ClusterBuildStrategy".to_string(),
            name: "buildah".to_string(),
            spec: StrategySpec {
                steps: vec![Step {
                    name: "build-and-push".to_string(),
                    ..Default::default()
                }],
                volumes: vec![StrategyVolume {
                    overridable: Some(false),
                    description: None,
                    volume: k8s_openapi::api::core::v1::Volume {
                        name: "buildah-images".to_string(),
                        ..Default::default()
                    },
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn spec() -> BuildSpec {
        BuildSpec {
            source: Some(Source {
                type_: SourceType::Git,
                git: Some(Git {
                    url: "https://github.com/shipwright-io/sample-go".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            strategy: StrategyRef {
                name: "buildah".to_string(),
                kind: None,
            },
            output: Image {
                image: "registry/ns/img:latest".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn valid_embedded_spec_registers() {
        assert!(embedded_build_spec(&spec(), &strategy()).is_ok());
    }

    #[test]
    fn missing_output_is_rejected() {
        let mut spec = spec();
        spec.output.image.clear();
        let err = embedded_build_spec(&spec, &strategy()).unwrap_err();
        assert_eq!(err.reason, BUILD_REGISTRATION_FAILED);
    }

    #[test]
    fn unknown_step_resource_is_rejected() {
        let overrides = vec![StepResourceOverride {
            name: "build".to_string(),
            resources: Default::default(),
        }];
        let err = step_resources(&strategy().spec.steps, &overrides).unwrap_err();

        assert_eq!(err.reason, UNDEFINED_STEP_RESOURCE);
        assert!(err.message.contains("\"build\""));
    }

    #[test]
    fn runtime_class_must_be_subdomain() {
        assert!(runtime_class_name(Some("gvisor")).is_ok());
        assert!(runtime_class_name(None).is_ok());
        assert_eq!(
            runtime_class_name(Some("Not_Valid")).unwrap_err().reason,
            RUNTIME_CLASS_NAME_NOT_VALID
        );
    }
}
