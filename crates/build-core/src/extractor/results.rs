use chrono::DateTime;
use tracing::warn;

use crate::compiler::{
    DEFAULT_SOURCE_NAME, RESULT_BRANCH_NAME, RESULT_BUNDLE_DIGEST, RESULT_COMMIT_AUTHOR,
    RESULT_COMMIT_SHA, RESULT_IMAGE_DIGEST, RESULT_IMAGE_SIZE, RESULT_IMAGE_VULNERABILITIES,
    RESULT_SOURCE_TIMESTAMP, source_result_name,
};
use crate::crds::build::{BuildSpec, SourceType};
use crate::crds::buildrun::{
    BuildRunStatus, GitSourceResult, OciArtifactSourceResult, Output, SourceResult, Vulnerability,
};
use crate::crds::tekton::{PipelineRun, RunResult, TaskRun};

fn find_result<'r>(results: &'r [RunResult], name: &str) -> Option<&'r str> {
    results
        .iter()
        .find(|r| r.name == name)
        .and_then(|r| r.value.as_string())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn source_value<'r>(results: &'r [RunResult], field: &str) -> Option<&'r str> {
    find_result(results, &source_result_name(DEFAULT_SOURCE_NAME, field))
}

fn severity(code: &str) -> &'static str {
    match code.to_ascii_uppercase().as_str() {
        "L" => "low",
        "M" => "medium",
        "H" => "high",
        "C" => "critical",
        _ => "unknown",
    }
}

/// Parses the `<id>:<severity>` list the image-processing step writes,
/// e.g. `CVE-2024-1:H,CVE-2024-2:L`.
pub fn parse_vulnerabilities(raw: &str) -> Vec<Vulnerability> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, code) = entry.split_once(':').unwrap_or((entry, ""));
            Vulnerability {
                id: id.to_string(),
                severity: severity(code).to_string(),
            }
        })
        .collect()
}

fn source_result(spec: &BuildSpec, results: &[RunResult]) -> Option<SourceResult> {
    let source = spec.source.as_ref()?;

    let mut result = SourceResult {
        name: DEFAULT_SOURCE_NAME.to_string(),
        ..Default::default()
    };

    match source.type_ {
        SourceType::Git if source.git.is_some() => {
            let git = GitSourceResult {
                commit_sha: source_value(results, RESULT_COMMIT_SHA).map(str::to_string),
                commit_author: source_value(results, RESULT_COMMIT_AUTHOR).map(str::to_string),
                branch_name: source_value(results, RESULT_BRANCH_NAME).map(str::to_string),
            };
            if git != GitSourceResult::default() {
                result.git = Some(git);
            }
        }
        SourceType::Oci if source.oci_artifact.is_some() => {
            result.oci_artifact = source_value(results, RESULT_BUNDLE_DIGEST).map(|digest| {
                OciArtifactSourceResult {
                    digest: digest.to_string(),
                }
            });
        }
        _ => {}
    }

    if let Some(raw) = source_value(results, RESULT_SOURCE_TIMESTAMP) {
        match raw.parse::<i64>() {
            Ok(seconds) => result.timestamp = DateTime::from_timestamp(seconds, 0),
            Err(e) => warn!(timestamp = raw, error = %e, "⚠️ Ignoring unparsable source timestamp"),
        }
    }

    (result.git.is_some() || result.oci_artifact.is_some() || result.timestamp.is_some())
        .then_some(result)
}

fn output_result(existing: Option<Output>, results: &[RunResult]) -> Output {
    let mut output = existing.unwrap_or_default();

    if let Some(digest) = find_result(results, RESULT_IMAGE_DIGEST) {
        output.digest = Some(digest.to_string());
    }
    if let Some(raw) = find_result(results, RESULT_IMAGE_SIZE) {
        match raw.parse::<i64>() {
            Ok(size) => output.size = Some(size),
            Err(e) => warn!(size = raw, error = %e, "⚠️ Ignoring unparsable output image size"),
        }
    }
    if let Some(raw) = find_result(results, RESULT_IMAGE_VULNERABILITIES) {
        output.vulnerabilities = parse_vulnerabilities(raw);
    }

    output
}

/// Copies source and output results into `status`. The source results are
/// read against the Build spec recorded in the status.
pub fn apply_results(status: &mut BuildRunStatus, results: &[RunResult]) {
    if results.is_empty() {
        return;
    }

    if let Some(source) = status
        .build_spec
        .as_ref()
        .and_then(|spec| source_result(spec, results))
    {
        status.sources.retain(|s| s.name != source.name);
        status.sources.push(source);
    }

    let output = output_result(status.output.take(), results);
    status.output = (output != Output::default()).then_some(output);
}

/// Results of a PipelineRun: its own when it declares any, otherwise the
/// results of its child TaskRuns in the order given.
pub fn child_results(pipeline_run: &PipelineRun, children: &[TaskRun]) -> Vec<RunResult> {
    let own = pipeline_run
        .status
        .as_ref()
        .map(|s| s.results.clone())
        .unwrap_or_default();
    if !own.is_empty() {
        return own;
    }

    children
        .iter()
        .filter_map(|task_run| task_run.status.as_ref())
        .flat_map(|status| status.results.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::build::{Git, OciArtifact, Source};
    use crate::crds::tekton::{
        ParamValue, PipelineRunSpec, PipelineRunStatus, TaskRunSpec, TaskRunStatus,
    };

    fn result(name: &str, value: &str) -> RunResult {
        RunResult {
            name: name.to_string(),
            value: ParamValue::String(value.to_string()),
        }
    }

    fn git_spec() -> BuildSpec {
        BuildSpec {
            source: Some(Source {
                type_: SourceType::Git,
                git: Some(Git {
                    url: "https://github.com/shipwright-io/sample-go".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn git_results_and_timestamp_land_on_the_default_source() {
        let mut status = BuildRunStatus {
            build_spec: Some(git_spec()),
            ..Default::default()
        };

        apply_results(
            &mut status,
            &[
                result("shp-source-default-commit-sha", "0e0583421a5e4bf562ffe33f3651e16ba0c78591"),
                result("shp-source-default-commit-author", "Jane Doe"),
                result("shp-source-default-branch-name", "main"),
                result("shp-source-default-source-timestamp", "1691650396"),
                result("shp-image-digest", "sha256:fe1b73cd25ac3f11dec752755e2"),
                result("shp-image-size", "230"),
            ],
        );

        let source = &status.sources[0];
        assert_eq!(source.name, "default");
        let git = source.git.as_ref().unwrap();
        assert_eq!(git.commit_author.as_deref(), Some("Jane Doe"));
        assert_eq!(git.branch_name.as_deref(), Some("main"));
        assert_eq!(source.timestamp.map(|t| t.timestamp()), Some(1691650396));

        let output = status.output.as_ref().unwrap();
        assert_eq!(output.digest.as_deref(), Some("sha256:fe1b73cd25ac3f11dec752755e2"));
        assert_eq!(output.size, Some(230));
    }

    #[test]
    fn bundle_digest_is_reported_for_oci_sources() {
        let mut status = BuildRunStatus {
            build_spec: Some(BuildSpec {
                source: Some(Source {
                    type_: SourceType::Oci,
                    oci_artifact: Some(OciArtifact {
                        image: "ghcr.io/shipwright-io/sample-go/source-bundle:latest".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        apply_results(
            &mut status,
            &[result("shp-source-default-image-digest", "sha256:0f5e2070b534f9b880ed093a537626e3c7fdd28d5328a8d6df8d29cd3da760c7")],
        );

        assert_eq!(
            status.sources[0].oci_artifact.as_ref().map(|o| o.digest.as_str()),
            Some("sha256:0f5e2070b534f9b880ed093a537626e3c7fdd28d5328a8d6df8d29cd3da760c7")
        );
        assert_eq!(status.output, None);
    }

    #[test]
    fn bad_numbers_are_skipped() {
        let mut status = BuildRunStatus {
            build_spec: Some(git_spec()),
            ..Default::default()
        };

        apply_results(
            &mut status,
            &[
                result("shp-source-default-source-timestamp", "yesterday"),
                result("shp-image-size", "big"),
                result("shp-image-digest", "sha256:abc"),
            ],
        );

        assert!(status.sources.is_empty());
        let output = status.output.as_ref().unwrap();
        assert_eq!(output.size, None);
        assert_eq!(output.digest.as_deref(), Some("sha256:abc"));
    }

    #[test]
    fn vulnerabilities_map_severity_codes() {
        assert_eq!(
            parse_vulnerabilities("CVE-2023-1:H,CVE-2023-2:c, CVE-2023-3:x"),
            vec![
                Vulnerability {
                    id: "CVE-2023-1".to_string(),
                    severity: "high".to_string()
                },
                Vulnerability {
                    id: "CVE-2023-2".to_string(),
                    severity: "critical".to_string()
                },
                Vulnerability {
                    id: "CVE-2023-3".to_string(),
                    severity: "unknown".to_string()
                },
            ]
        );
        assert!(parse_vulnerabilities("").is_empty());
    }

    #[test]
    fn pipeline_results_fall_back_to_children() {
        let mut pipeline_run = PipelineRun::new("run-abcde", PipelineRunSpec::default());
        pipeline_run.status = Some(PipelineRunStatus::default());

        let child = |name: &str, results: Vec<RunResult>| {
            let mut task_run = TaskRun::new(name, TaskRunSpec::default());
            task_run.status = Some(TaskRunStatus {
                results,
                ..Default::default()
            });
            task_run
        };
        let children = [
            child(
                "run-abcde-source-acquisition",
                vec![result("shp-source-default-commit-sha", "abc")],
            ),
            child("run-abcde-output-image", vec![result("shp-image-digest", "sha256:def")]),
        ];

        let results = child_results(&pipeline_run, &children);
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["shp-source-default-commit-sha", "shp-image-digest"]);

        pipeline_run.status = Some(PipelineRunStatus {
            results: vec![result("shp-image-digest", "sha256:own")],
            ..Default::default()
        });
        assert_eq!(child_results(&pipeline_run, &children).len(), 1);
    }
}
