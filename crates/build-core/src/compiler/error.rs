use std::fmt;

use crate::compiler::ExecutorKind;
use crate::conditions::{
    OUTPUT_TIMESTAMP_NOT_VALID, PIPELINE_RUN_GENERATION_FAILED, TASK_RUN_GENERATION_FAILED,
    UNDEFINED_VOLUME, VOLUME_NOT_OVERRIDABLE,
};
use crate::resolver::ResolveError;

/// Generation stage a failure happened in, used as the message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Context,
    Initialize,
    Sources,
    Strategy,
    Output,
    Infrastructure,
    Metadata,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Context => "preparing execution context",
            Stage::Initialize => "initializing executor",
            Stage::Sources => "source acquisition",
            Stage::Strategy => "build strategy",
            Stage::Output => "output image",
            Stage::Infrastructure => "infrastructure configuration",
            Stage::Metadata => "metadata configuration",
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StageError {
    #[error("failed to merge environment variables: {0}")]
    MergeEnv(ResolveError),

    #[error(
        "error(s) occurred merging environment variables into BuildStrategy {strategy:?} steps: {source}"
    )]
    StepEnv {
        strategy: String,
        source: ResolveError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("unexpected parameter without any value: {0}")]
    MissingValue(String),

    #[error(
        "cannot use SourceTimestamp setting, because there is no source timestamp available for this source"
    )]
    NoSourceTimestamp,

    #[error(
        "cannot parse output timestamp {0} as a number, must be Zero, SourceTimestamp, BuildTimestamp, or a an integer"
    )]
    InvalidTimestamp(String),

    #[error("failed to encode vulnerability scan settings: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("{stage}: {source}")]
pub struct CompileError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl CompileError {
    pub fn new(stage: Stage, source: StageError) -> Self {
        Self { stage, source }
    }

    /// Condition reason the BuildRun fails with when generation stops here.
    pub fn reason(&self, kind: ExecutorKind) -> &'static str {
        match &self.source {
            StageError::NoSourceTimestamp | StageError::InvalidTimestamp(_) => {
                OUTPUT_TIMESTAMP_NOT_VALID
            }
            StageError::Resolve(ResolveError::VolumeNotOverridable(_)) => VOLUME_NOT_OVERRIDABLE,
            StageError::Resolve(ResolveError::VolumeNotFound(_)) => UNDEFINED_VOLUME,
            _ => match kind {
                ExecutorKind::TaskRun => TASK_RUN_GENERATION_FAILED,
                ExecutorKind::PipelineRun => PIPELINE_RUN_GENERATION_FAILED,
            },
        }
    }
}
