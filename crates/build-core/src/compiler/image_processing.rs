use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount};

use crate::compiler::sources::{ensure_volume, ensure_volume_mount, mount_secret, set_env};
use crate::compiler::{
    CompileInput, DNS_LABEL_FORBIDDEN, PARAM_OUTPUT_DIRECTORY, PARAM_OUTPUT_IMAGE,
    PARAM_OUTPUT_INSECURE, RESULT_IMAGE_DIGEST, RESULT_IMAGE_SIZE, RESULT_IMAGE_VULNERABILITIES,
    StageError,
};
use crate::crds::build::{Image, VulnerabilityScanOptions};
use crate::crds::common::time_to_utc;
use crate::crds::tekton::{TaskSpec, TaskStep};
use crate::resolver::{effective_push_secret, merge_maps};

pub const IMAGE_PROCESSING_STEP: &str = "image-processing";

/// Where the output directory is mounted in a single-phase job.
pub(crate) const OUTPUT_DIRECTORY_MOUNT_PATH: &str = "/workspace/output-image";
/// Output directory location inside the shared source workspace of a pipeline.
pub(crate) const PIPELINE_OUTPUT_DIRECTORY: &str = "/workspace/source/output-image";

const PUSH_SECRET_PATH: &str = "/workspace/shp-push-secret";
const TMP_DIR: &str = "/shp-tmp";
const TRIVY_CACHE_VOLUME: &str = "trivy-cache-data";
const TRIVY_CACHE_DIR: &str = "/trivy-cache-data";

const TIMESTAMP_ZERO: &str = "Zero";
const TIMESTAMP_SOURCE: &str = "SourceTimestamp";
const TIMESTAMP_BUILD: &str = "BuildTimestamp";

fn buildrun_output<'a>(input: &CompileInput<'a>) -> Option<&'a Image> {
    input.buildrun.spec.output.as_ref()
}

fn vulnerability_scan<'a>(input: &CompileInput<'a>) -> Option<&'a VulnerabilityScanOptions> {
    buildrun_output(input)
        .and_then(|o| o.vulnerability_scan.as_ref())
        .or(input.build.spec.output.vulnerability_scan.as_ref())
}

fn image_timestamp<'a>(input: &CompileInput<'a>) -> Option<&'a str> {
    buildrun_output(input)
        .and_then(|o| o.timestamp.as_deref())
        .or(input.build.spec.output.timestamp.as_deref())
}

fn mutate_args(flag: &str, values: &BTreeMap<String, String>) -> Vec<String> {
    values
        .iter()
        .flat_map(|(key, value)| [flag.to_string(), format!("{key}={value}")])
        .collect()
}

fn creation_unix(input: &CompileInput<'_>) -> i64 {
    input
        .buildrun
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(time_to_utc)
        .unwrap_or_else(Utc::now)
        .timestamp()
}

/// Arguments for the image-processing step, before the fixed image and result
/// arguments. Empty means the step is not needed.
///
/// `source_timestamp` is the flag and value pointing at the source timestamp,
/// or `None` when the source step does not produce one.
pub(crate) fn processing_args(
    input: &CompileInput<'_>,
    output_directory: bool,
    source_timestamp: Option<[String; 2]>,
) -> Result<Vec<String>, StageError> {
    let mut args = Vec::new();

    if output_directory {
        args.extend([
            "--push".to_string(),
            format!("$(params.{PARAM_OUTPUT_DIRECTORY})"),
        ]);
    }

    let empty = Image::default();
    let run_output = buildrun_output(input).unwrap_or(&empty);
    let build_output = &input.build.spec.output;
    args.extend(mutate_args(
        "--annotation",
        &merge_maps(&build_output.annotations, &run_output.annotations),
    ));
    args.extend(mutate_args(
        "--label",
        &merge_maps(&build_output.labels, &run_output.labels),
    ));

    if let Some(scan) = vulnerability_scan(input).filter(|s| s.enabled) {
        let settings =
            serde_json::to_string(scan).map_err(|e| StageError::Encode(e.to_string()))?;
        args.extend(["--vuln-settings".to_string(), settings]);
        if input.config.vulnerability_count_limit > 0 {
            args.extend([
                "--vuln-count-limit".to_string(),
                input.config.vulnerability_count_limit.to_string(),
            ]);
        }
    }

    match image_timestamp(input) {
        None => {}
        Some(TIMESTAMP_ZERO) => args.extend(["--image-timestamp".to_string(), "0".to_string()]),
        Some(TIMESTAMP_SOURCE) => args.extend(source_timestamp.ok_or(StageError::NoSourceTimestamp)?),
        Some(TIMESTAMP_BUILD) => args.extend([
            "--image-timestamp".to_string(),
            creation_unix(input).to_string(),
        ]),
        Some(other) => {
            other
                .parse::<i64>()
                .map_err(|_| StageError::InvalidTimestamp(other.to_string()))?;
            args.extend(["--image-timestamp".to_string(), other.to_string()]);
        }
    }

    Ok(args)
}

/// `shp-tmp-<step>` made a DNS label, suffixed with a short hash of the step
/// name so sanitized names stay unique.
fn tmp_volume_name(step: &str) -> String {
    let sanitized = DNS_LABEL_FORBIDDEN
        .replace_all(&format!("shp-tmp-{step}"), "-")
        .to_lowercase();
    let mut sanitized = sanitized.trim_matches('-').to_string();

    let digest = sha256::digest(step);
    let hash = &digest[..8];
    sanitized.truncate(63 - hash.len() - 1);

    format!("{sanitized}-{hash}")
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Builds the image-processing step and adds the volumes it needs to `spec`.
/// `output_directory` mounts the single-phase output volume read-only.
pub(crate) fn image_processing_step(
    input: &CompileInput<'_>,
    spec: &mut TaskSpec,
    mut args: Vec<String>,
    output_directory: bool,
) -> TaskStep {
    args.extend([
        "--image".to_string(),
        format!("$(params.{PARAM_OUTPUT_IMAGE})"),
        format!("--insecure=$(params.{PARAM_OUTPUT_INSECURE})"),
        "--result-file-image-digest".to_string(),
        format!("$(results.{RESULT_IMAGE_DIGEST}.path)"),
        "--result-file-image-size".to_string(),
        format!("$(results.{RESULT_IMAGE_SIZE}.path)"),
        "--result-file-image-vulnerabilities".to_string(),
        format!("$(results.{RESULT_IMAGE_VULNERABILITIES}.path)"),
    ]);

    let mut step = input
        .config
        .image_processing_container_template
        .to_step(IMAGE_PROCESSING_STEP);
    step.args = args;

    if output_directory {
        step.volume_mounts.push(VolumeMount {
            name: PARAM_OUTPUT_DIRECTORY.to_string(),
            mount_path: OUTPUT_DIRECTORY_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if let Some(secret) = effective_push_secret(&input.build.spec, &input.buildrun.spec) {
        mount_secret(spec, &mut step, &secret, PUSH_SECRET_PATH);
    }

    let tmp_volume = tmp_volume_name(&step.name);
    ensure_volume(spec, empty_dir(&tmp_volume));
    ensure_volume_mount(
        &mut step,
        VolumeMount {
            name: tmp_volume,
            mount_path: TMP_DIR.to_string(),
            ..Default::default()
        },
    );
    set_env(&mut step, "TMPDIR", TMP_DIR);

    ensure_volume(spec, empty_dir(TRIVY_CACHE_VOLUME));
    ensure_volume_mount(
        &mut step,
        VolumeMount {
            name: TRIVY_CACHE_VOLUME.to_string(),
            mount_path: TRIVY_CACHE_DIR.to_string(),
            ..Default::default()
        },
    );
    set_env(&mut step, "TRIVY_CACHE_DIR", TRIVY_CACHE_DIR);

    step
}
