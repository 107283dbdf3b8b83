use k8s_openapi::api::core::v1::{
    Capabilities, EnvVar, ResourceRequirements, SecurityContext,
};
use serde::Deserialize;

use crate::crds::tekton::TaskStep;

const GIT_DEFAULT_IMAGE: &str = "ghcr.io/shipwright-io/build/git:latest";
const BUNDLE_DEFAULT_IMAGE: &str = "ghcr.io/shipwright-io/build/bundle:latest";
const IMAGE_PROCESSING_DEFAULT_IMAGE: &str = "ghcr.io/shipwright-io/build/image-processing:latest";
const WAITER_DEFAULT_IMAGE: &str = "ghcr.io/shipwright-io/build/waiter:latest";

const NON_ROOT: i64 = 1000;
const ROOT: i64 = 0;

/// Container settings for one of the support steps the compiler injects.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ContainerTemplate {
    pub fn to_step(&self, name: &str) -> TaskStep {
        TaskStep {
            name: name.to_string(),
            image: self.image.clone(),
            image_pull_policy: self.image_pull_policy.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            compute_resources: self.resources.clone(),
            volume_mounts: vec![],
            security_context: self.security_context.clone(),
        }
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        if let Some(image) = image.filter(|i| !i.is_empty()) {
            self.image = image;
        }
        self
    }
}

/// Everything the execution plan compiler needs besides the three resources.
#[derive(Clone, Debug, PartialEq)]
pub struct CompilerConfig {
    pub git_container_template: ContainerTemplate,
    pub bundle_container_template: ContainerTemplate,
    pub image_processing_container_template: ContainerTemplate,
    pub waiter_container_template: ContainerTemplate,
    pub vulnerability_count_limit: u32,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            git_container_template: non_root_template(GIT_DEFAULT_IMAGE, "/ko-app/git", vec![]),
            bundle_container_template: non_root_template(
                BUNDLE_DEFAULT_IMAGE,
                "/ko-app/bundle",
                vec![],
            ),
            image_processing_container_template: image_processing_template(),
            waiter_container_template: non_root_template(
                WAITER_DEFAULT_IMAGE,
                "/ko-app/waiter",
                vec!["start".to_string()],
            ),
            vulnerability_count_limit: 50,
        }
    }
}

fn non_root_template(image: &str, command: &str, args: Vec<String>) -> ContainerTemplate {
    ContainerTemplate {
        image: image.to_string(),
        command: vec![command.to_string()],
        args,
        security_context: Some(SecurityContext {
            run_as_user: Some(NON_ROOT),
            run_as_group: Some(NON_ROOT),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// Runs as root with DAC_OVERRIDE so it can read whatever the strategy steps wrote.
fn image_processing_template() -> ContainerTemplate {
    ContainerTemplate {
        image: IMAGE_PROCESSING_DEFAULT_IMAGE.to_string(),
        command: vec!["/ko-app/image-processing".to_string()],
        env: vec![EnvVar {
            name: "HOME".to_string(),
            value: Some("/shared-home".to_string()),
            ..Default::default()
        }],
        security_context: Some(SecurityContext {
            run_as_user: Some(ROOT),
            capabilities: Some(Capabilities {
                add: Some(vec!["DAC_OVERRIDE".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_override_replaces_only_the_image() {
        let template = CompilerConfig::default()
            .git_container_template
            .with_image(Some("quay.io/custom/git:v1".to_string()));

        assert_eq!(template.image, "quay.io/custom/git:v1");
        assert_eq!(template.command, vec!["/ko-app/git"]);
    }

    #[test]
    fn template_decodes_from_json() {
        let template: ContainerTemplate = serde_json::from_str(
            r#"{"image":"quay.io/waiter:v2","args":["start"],"securityContext":{"runAsUser":1001}}"#,
        )
        .unwrap();
        let step = template.to_step("source-local");

        assert_eq!(step.name, "source-local");
        assert_eq!(step.args, vec!["start"]);
        assert_eq!(
            step.security_context.and_then(|s| s.run_as_user),
            Some(1001)
        );
    }
}
