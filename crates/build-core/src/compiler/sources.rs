use k8s_openapi::api::core::v1::{EnvVar, SecretVolumeSource, Volume, VolumeMount};

use crate::compiler::{
    DEFAULT_SOURCE_NAME, DNS_LABEL_FORBIDDEN, PARAM_SOURCE_ROOT, RESULT_ERROR_MESSAGE,
    RESULT_ERROR_REASON, source_result_name,
};
use crate::configs::CompilerConfig;
use crate::crds::build::{Git, Local, OciArtifact, PruneOption, Source, SourceType};
use crate::crds::tekton::{TaskResult, TaskSpec, TaskStep};

pub const RESULT_SOURCE_TIMESTAMP: &str = "source-timestamp";
pub const RESULT_COMMIT_SHA: &str = "commit-sha";
pub const RESULT_COMMIT_AUTHOR: &str = "commit-author";
pub const RESULT_BRANCH_NAME: &str = "branch-name";
pub const RESULT_BUNDLE_DIGEST: &str = "image-digest";

/// Container name the local upload targets.
pub const LOCAL_SOURCE_STEP: &str = "source-local";

const SOURCE_SECRET_PATH: &str = "/workspace/shp-source-secret";
const PULL_SECRET_PATH: &str = "/workspace/shp-pull-secret";

// World-readable: volumes are mounted as root and the steps run as non-root.
pub(crate) const READ_ONLY_MODE: i32 = 0o444;

const MAX_VOLUME_NAME: usize = 63;

fn result_path(name: &str) -> String {
    format!("$(results.{name}.path)")
}

fn source_result_path(field: &str) -> String {
    result_path(&source_result_name(DEFAULT_SOURCE_NAME, field))
}

/// Volume name for a secret: `shp-<secret>` with forbidden characters
/// dashed, cut to 63 characters and no trailing dash.
pub(crate) fn secret_volume_name(secret: &str) -> String {
    let mut name = DNS_LABEL_FORBIDDEN
        .replace_all(&format!("shp-{secret}"), "-")
        .into_owned();
    name.truncate(MAX_VOLUME_NAME);
    name.strip_suffix('-').map(str::to_string).unwrap_or(name)
}

/// Adds a secret volume unless one with the same name is present and returns
/// its name.
pub(crate) fn add_secret_volume(spec: &mut TaskSpec, secret: &str) -> String {
    let name = secret_volume_name(secret);
    let present = spec
        .volumes
        .iter()
        .any(|v| v.secret.is_some() && v.name == name);

    if !present {
        spec.volumes.push(Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                default_mode: Some(READ_ONLY_MODE),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    name
}

/// Mounts `secret` read-only into `step` and passes the path with `--secret-path`.
pub(crate) fn mount_secret(spec: &mut TaskSpec, step: &mut TaskStep, secret: &str, path: &str) {
    let volume = add_secret_volume(spec, secret);
    step.volume_mounts.push(VolumeMount {
        name: volume,
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
    step.args.extend(["--secret-path".to_string(), path.to_string()]);
}

pub(crate) fn ensure_volume(spec: &mut TaskSpec, volume: Volume) {
    if !spec.has_volume(&volume.name) {
        spec.volumes.push(volume);
    }
}

pub(crate) fn ensure_volume_mount(step: &mut TaskStep, mount: VolumeMount) {
    if !step.volume_mounts.iter().any(|m| m.name == mount.name) {
        step.volume_mounts.push(mount);
    }
}

/// Sets `name`, replacing the value of an existing variable.
pub(crate) fn set_env(step: &mut TaskStep, name: &str, value: &str) {
    match step.env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => step.env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }),
    }
}

fn push_result(spec: &mut TaskSpec, field: &str, description: &str) {
    spec.results.push(TaskResult {
        name: source_result_name(DEFAULT_SOURCE_NAME, field),
        description: description.to_string(),
    });
}

fn error_result_args() -> [String; 4] {
    [
        "--result-file-error-message".to_string(),
        result_path(RESULT_ERROR_MESSAGE),
        "--result-file-error-reason".to_string(),
        result_path(RESULT_ERROR_REASON),
    ]
}

fn git_step(config: &CompilerConfig, spec: &mut TaskSpec, git: &Git) -> TaskStep {
    for (field, description) in [
        (RESULT_COMMIT_SHA, "The commit SHA of the cloned source."),
        (
            RESULT_COMMIT_AUTHOR,
            "The author of the last commit of the cloned source.",
        ),
        (
            RESULT_BRANCH_NAME,
            "The name of the branch used of the cloned source.",
        ),
    ] {
        push_result(spec, field, description);
    }

    let mut step = config
        .git_container_template
        .to_step(&format!("source-{DEFAULT_SOURCE_NAME}"));
    step.args = vec![
        "--url".to_string(),
        git.url.clone(),
        "--target".to_string(),
        format!("$(params.{PARAM_SOURCE_ROOT})"),
        "--result-file-commit-sha".to_string(),
        source_result_path(RESULT_COMMIT_SHA),
        "--result-file-commit-author".to_string(),
        source_result_path(RESULT_COMMIT_AUTHOR),
        "--result-file-branch-name".to_string(),
        source_result_path(RESULT_BRANCH_NAME),
    ];
    step.args.extend(error_result_args());
    step.args.extend([
        "--result-file-source-timestamp".to_string(),
        source_result_path(RESULT_SOURCE_TIMESTAMP),
    ]);

    if let Some(revision) = git.revision.as_deref().filter(|r| !r.is_empty()) {
        step.args.extend(["--revision".to_string(), revision.to_string()]);
    }
    if let Some(depth) = git.depth {
        step.args.extend(["--depth".to_string(), depth.to_string()]);
    }
    if let Some(secret) = git.clone_secret.as_deref().filter(|s| !s.is_empty()) {
        mount_secret(spec, &mut step, secret, SOURCE_SECRET_PATH);
    }

    step
}

fn bundle_step(config: &CompilerConfig, spec: &mut TaskSpec, oci: &OciArtifact) -> TaskStep {
    push_result(spec, RESULT_BUNDLE_DIGEST, "The digest of the bundle image.");

    let mut step = config
        .bundle_container_template
        .to_step(&format!("source-{DEFAULT_SOURCE_NAME}"));
    step.args = vec![
        "--image".to_string(),
        oci.image.clone(),
        "--target".to_string(),
        format!("$(params.{PARAM_SOURCE_ROOT})"),
        "--result-file-image-digest".to_string(),
        source_result_path(RESULT_BUNDLE_DIGEST),
        "--result-file-source-timestamp".to_string(),
        source_result_path(RESULT_SOURCE_TIMESTAMP),
    ];
    step.args.extend(error_result_args());

    if let Some(secret) = oci.pull_secret.as_deref().filter(|s| !s.is_empty()) {
        mount_secret(spec, &mut step, secret, PULL_SECRET_PATH);
    }
    if oci.prune == Some(PruneOption::AfterPull) {
        step.args.push("--prune".to_string());
    }

    step
}

fn local_step(config: &CompilerConfig, local: Option<&Local>) -> TaskStep {
    let mut step = config.waiter_container_template.to_step(LOCAL_SOURCE_STEP);
    if let Some(timeout) = local.and_then(|l| l.timeout.as_deref()) {
        step.args.push(format!("--timeout={timeout}"));
    }
    step
}

/// Appends the step fetching the build's source, with the results it writes.
/// A missing source adds nothing.
pub(crate) fn append_source_step(
    config: &CompilerConfig,
    spec: &mut TaskSpec,
    source: Option<&Source>,
) {
    let Some(source) = source else {
        return;
    };

    let step = match (source.type_, &source.git, &source.oci_artifact) {
        (SourceType::Local, _, _) => local_step(config, source.local.as_ref()),
        (SourceType::Oci, _, Some(oci)) => {
            push_result(spec, RESULT_SOURCE_TIMESTAMP, "The timestamp of the source.");
            bundle_step(config, spec, oci)
        }
        (SourceType::Git, Some(git), _) => {
            push_result(spec, RESULT_SOURCE_TIMESTAMP, "The timestamp of the source.");
            git_step(config, spec, git)
        }
        _ => return,
    };

    spec.steps.push(step);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_source(git: Git) -> Source {
        Source {
            type_: SourceType::Git,
            git: Some(git),
            ..Default::default()
        }
    }

    #[test]
    fn secret_volume_names_are_dns_labels() {
        assert_eq!(secret_volume_name("registry-creds"), "shp-registry-creds");
        assert_eq!(secret_volume_name("my.secret_name"), "shp-my-secret-name");

        let long = format!("{}.x", "a".repeat(58));
        let name = secret_volume_name(&long);
        assert_eq!(name.len(), 62);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn git_step_carries_url_and_result_files() {
        let config = CompilerConfig::default();
        let mut spec = TaskSpec::default();

        append_source_step(
            &config,
            &mut spec,
            Some(&git_source(Git {
                url: "https://github.com/shipwright-io/sample-go".to_string(),
                revision: Some("main".to_string()),
                depth: Some(1),
                ..Default::default()
            })),
        );

        let step = &spec.steps[0];
        assert_eq!(step.name, "source-default");
        assert_eq!(step.image, config.git_container_template.image);
        assert_eq!(
            &step.args[..4],
            [
                "--url",
                "https://github.com/shipwright-io/sample-go",
                "--target",
                "$(params.shp-source-root)"
            ]
        );
        assert!(step.args.windows(2).any(|w| w
            == [
                "--result-file-commit-sha",
                "$(results.shp-source-default-commit-sha.path)"
            ]));
        assert!(step.args.ends_with(&[
            "--revision".to_string(),
            "main".to_string(),
            "--depth".to_string(),
            "1".to_string(),
        ]));
        assert!(spec.volumes.is_empty());

        let results: Vec<_> = spec.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            results,
            [
                "shp-source-default-source-timestamp",
                "shp-source-default-commit-sha",
                "shp-source-default-commit-author",
                "shp-source-default-branch-name"
            ]
        );
    }

    #[test]
    fn clone_secret_is_mounted_once() {
        let config = CompilerConfig::default();
        let mut spec = TaskSpec::default();
        add_secret_volume(&mut spec, "git-creds");

        append_source_step(
            &config,
            &mut spec,
            Some(&git_source(Git {
                url: "git@github.com:shipwright-io/sample-go.git".to_string(),
                clone_secret: Some("git-creds".to_string()),
                ..Default::default()
            })),
        );

        assert_eq!(spec.volumes.len(), 1);
        let volume = &spec.volumes[0];
        assert_eq!(volume.name, "shp-git-creds");
        assert_eq!(
            volume.secret.as_ref().and_then(|s| s.default_mode),
            Some(0o444)
        );

        let step = &spec.steps[0];
        assert_eq!(step.volume_mounts[0].mount_path, SOURCE_SECRET_PATH);
        assert_eq!(step.volume_mounts[0].read_only, Some(true));
        assert!(step.args.ends_with(&[
            "--secret-path".to_string(),
            SOURCE_SECRET_PATH.to_string()
        ]));
    }

    #[test]
    fn bundle_step_prunes_after_pull() {
        let config = CompilerConfig::default();
        let mut spec = TaskSpec::default();

        append_source_step(
            &config,
            &mut spec,
            Some(&Source {
                type_: SourceType::Oci,
                oci_artifact: Some(OciArtifact {
                    image: "ghcr.io/shipwright-io/sample-go/source-bundle:latest".to_string(),
                    prune: Some(PruneOption::AfterPull),
                    pull_secret: Some("pull".to_string()),
                }),
                ..Default::default()
            }),
        );

        let step = &spec.steps[0];
        assert_eq!(step.image, config.bundle_container_template.image);
        assert_eq!(step.args.last().map(String::as_str), Some("--prune"));
        assert!(step.args.contains(&PULL_SECRET_PATH.to_string()));
        assert!(spec.has_result("shp-source-default-image-digest"));
        assert!(spec.has_result("shp-source-default-source-timestamp"));
    }

    #[test]
    fn local_source_waits_for_upload() {
        let config = CompilerConfig::default();
        let mut spec = TaskSpec::default();

        append_source_step(
            &config,
            &mut spec,
            Some(&Source {
                type_: SourceType::Local,
                local: Some(Local {
                    timeout: Some("1m0s".to_string()),
                    name: Some("local".to_string()),
                }),
                ..Default::default()
            }),
        );

        let step = &spec.steps[0];
        assert_eq!(step.name, LOCAL_SOURCE_STEP);
        assert_eq!(step.args, ["start", "--timeout=1m0s"]);
        assert!(spec.results.is_empty());
    }

    #[test]
    fn set_env_overrides_in_place() {
        let mut step = TaskStep {
            env: vec![EnvVar {
                name: "TMPDIR".to_string(),
                value: Some("/tmp".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        set_env(&mut step, "TMPDIR", "/shp-tmp");
        set_env(&mut step, "TRIVY_CACHE_DIR", "/trivy-cache-data");

        assert_eq!(step.env.len(), 2);
        assert_eq!(step.env[0].value.as_deref(), Some("/shp-tmp"));
    }
}
