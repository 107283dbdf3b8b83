//! Execution plan compiler.
//!
//! Turns a Build, a BuildRun and a resolved strategy into a TaskRun or a
//! PipelineRun. Both backends implement [`ExecutorGenerator`] and are driven
//! through the same ordered stages by [`generate`]; the first failing stage
//! aborts the rest. Nothing here talks to the cluster or touches BuildRun status.

mod ca_bundle;
mod error;
mod image_processing;
mod params;
mod pipelinerun;
mod security_context;
mod sources;
mod task_spec;
mod taskrun;

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::EnvVar;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::configs::CompilerConfig;
use crate::crds::build::Build;
use crate::crds::buildrun::BuildRun;
use crate::crds::strategy::ResolvedStrategy;
use crate::crds::tekton::{KIND_PIPELINE_RUN, KIND_TASK_RUN, PipelineRun, TaskRun};
use crate::resolver::merge_env_vars;

pub use error::{CompileError, Stage, StageError};
pub use image_processing::IMAGE_PROCESSING_STEP;
pub use pipelinerun::{
    PipelineRunGenerator, TASK_BUILD_STRATEGY, TASK_OUTPUT_IMAGE, TASK_SOURCE_ACQUISITION,
};
pub use sources::{
    LOCAL_SOURCE_STEP, RESULT_BRANCH_NAME, RESULT_BUNDLE_DIGEST, RESULT_COMMIT_AUTHOR,
    RESULT_COMMIT_SHA, RESULT_SOURCE_TIMESTAMP,
};
pub use taskrun::TaskRunGenerator;

pub const PARAM_OUTPUT_IMAGE: &str = "shp-output-image";
pub const PARAM_OUTPUT_INSECURE: &str = "shp-output-insecure";
pub const PARAM_SOURCE_ROOT: &str = "shp-source-root";
pub const PARAM_SOURCE_CONTEXT: &str = "shp-source-context";
pub const PARAM_OUTPUT_DIRECTORY: &str = "shp-output-directory";

pub const RESULT_IMAGE_DIGEST: &str = "shp-image-digest";
pub const RESULT_IMAGE_SIZE: &str = "shp-image-size";
pub const RESULT_IMAGE_VULNERABILITIES: &str = "shp-image-vulnerabilities";
pub const RESULT_ERROR_REASON: &str = "shp-error-reason";
pub const RESULT_ERROR_MESSAGE: &str = "shp-error-message";

pub const DEFAULT_SOURCE_NAME: &str = "default";
pub const SOURCE_ROOT: &str = "/workspace/source";

const WORKSPACE_SOURCE: &str = "source";

/// Result name a source step writes, e.g. `shp-source-default-commit-sha`.
pub fn source_result_name(source: &str, field: &str) -> String {
    format!("shp-source-{source}-{field}")
}

/// Job backend the controller creates for each BuildRun.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutorKind {
    #[default]
    TaskRun,
    PipelineRun,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::TaskRun => KIND_TASK_RUN,
            ExecutorKind::PipelineRun => KIND_PIPELINE_RUN,
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("unsupported BuildrunExecutor: {0}")]
pub struct UnsupportedExecutor(pub String);

impl FromStr for ExecutorKind {
    type Err = UnsupportedExecutor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            KIND_TASK_RUN => Ok(ExecutorKind::TaskRun),
            KIND_PIPELINE_RUN => Ok(ExecutorKind::PipelineRun),
            other => Err(UnsupportedExecutor(other.to_string())),
        }
    }
}

/// The generated job, not yet created in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum Executor {
    TaskRun(Box<TaskRun>),
    PipelineRun(Box<PipelineRun>),
}

impl Executor {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            Executor::TaskRun(_) => ExecutorKind::TaskRun,
            Executor::PipelineRun(_) => ExecutorKind::PipelineRun,
        }
    }
}

/// Everything a generator reads. `build` is the referenced Build, or a
/// transient one carrying the BuildRun's embedded spec.
#[derive(Debug, Clone, Copy)]
pub struct CompileInput<'a> {
    pub config: &'a CompilerConfig,
    pub build: &'a Build,
    pub buildrun: &'a BuildRun,
    pub service_account: &'a str,
    pub strategy: &'a ResolvedStrategy,
}

/// State handed from one stage to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    /// Build env with BuildRun env merged on top.
    pub combined_env: Vec<EnvVar>,
    /// The strategy leaves an OCI layout in the output directory for the
    /// image-processing step to push.
    pub output_directory: bool,
}

impl ExecutionContext {
    pub fn prepare(input: &CompileInput<'_>) -> Result<Self, StageError> {
        let combined_env = merge_env_vars(
            &input.buildrun.spec.env,
            &input.build.spec.env,
            true,
        )
        .map_err(StageError::MergeEnv)?;

        Ok(Self {
            combined_env,
            output_directory: false,
        })
    }
}

pub trait ExecutorGenerator {
    fn initialize(&mut self) -> Result<(), StageError>;

    fn source_acquisition(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError>;

    fn build_strategy(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError>;

    fn output_image(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError>;

    fn infrastructure(&mut self) -> Result<(), StageError>;

    fn metadata(&mut self) -> Result<(), StageError>;

    fn into_executor(self) -> Executor;
}

/// Runs every stage in order, tagging a failure with the stage it came from.
pub fn generate<G: ExecutorGenerator>(
    mut generator: G,
    input: &CompileInput<'_>,
) -> Result<Executor, CompileError> {
    let at = |stage| move |source| CompileError::new(stage, source);

    let mut ctx = ExecutionContext::prepare(input).map_err(at(Stage::Context))?;

    generator.initialize().map_err(at(Stage::Initialize))?;
    generator
        .source_acquisition(&mut ctx)
        .map_err(at(Stage::Sources))?;
    generator
        .build_strategy(&mut ctx)
        .map_err(at(Stage::Strategy))?;
    generator.output_image(&mut ctx).map_err(at(Stage::Output))?;
    generator.infrastructure().map_err(at(Stage::Infrastructure))?;
    generator.metadata().map_err(at(Stage::Metadata))?;

    Ok(generator.into_executor())
}

/// Compiles the job for the configured backend.
pub fn compile(kind: ExecutorKind, input: CompileInput<'_>) -> Result<Executor, CompileError> {
    match kind {
        ExecutorKind::TaskRun => generate(TaskRunGenerator::new(input), &input),
        ExecutorKind::PipelineRun => generate(PipelineRunGenerator::new(input), &input),
    }
}

/// Runs of characters a DNS label may not contain.
pub(crate) static DNS_LABEL_FORBIDDEN: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^a-zA-Z0-9-]+").unwrap());

/// 32-bit FNV-1a.
pub(crate) fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
