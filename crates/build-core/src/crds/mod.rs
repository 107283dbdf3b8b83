pub mod build;
pub mod buildrun;
pub mod common;
pub mod strategy;
pub mod tekton;

pub use build::{Build, BuildSpec, BuildStatus};
pub use buildrun::{BuildRun, BuildRunSpec, BuildRunStatus};
pub use common::{Condition, ConditionStatus};
pub use strategy::{BuildStrategy, ClusterBuildStrategy, ResolvedStrategy, StrategySpec};
pub use tekton::{PipelineRun, TaskRun};
