pub const BUILD_DOMAIN: &str = "build.shipwright.io";
pub const BUILD_RUN_DOMAIN: &str = "buildrun.shipwright.io";
pub const BUILD_STRATEGY_DOMAIN: &str = "buildstrategy.shipwright.io";
pub const CLUSTER_BUILD_STRATEGY_DOMAIN: &str = "clusterbuildstrategy.shipwright.io";

pub const BUILD_NAME: &str = "build.shipwright.io/name";
pub const BUILD_GENERATION: &str = "build.shipwright.io/generation";
pub const BUILD_RUN_NAME: &str = "buildrun.shipwright.io/name";
pub const BUILD_RUN_GENERATION: &str = "buildrun.shipwright.io/generation";
pub const BUILD_STRATEGY_NAME: &str = "buildstrategy.shipwright.io/name";
pub const BUILD_STRATEGY_GENERATION: &str = "buildstrategy.shipwright.io/generation";
pub const CLUSTER_BUILD_STRATEGY_NAME: &str = "clusterbuildstrategy.shipwright.io/name";
pub const CLUSTER_BUILD_STRATEGY_GENERATION: &str =
    "clusterbuildstrategy.shipwright.io/generation";

/// A Build carrying this annotation with `"true"` owns the BuildRuns that reference it.
pub const ANNOTATION_BUILD_RUN_DELETION: &str = "build.shipwright.io/build-run-deletion";

pub const ANNOTATION_SECURITY_CONTEXT_GROUP: &str =
    "buildrun.shipwright.io/security-context-group";
pub const ANNOTATION_SECURITY_CONTEXT_PASSWD: &str =
    "buildrun.shipwright.io/security-context-passwd";

const LAST_APPLIED_CONFIGURATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Strategy annotations that may travel onto the generated job.
pub fn is_propagatable_annotation(key: &str) -> bool {
    key != LAST_APPLIED_CONFIGURATION
        && ![
            CLUSTER_BUILD_STRATEGY_DOMAIN,
            BUILD_STRATEGY_DOMAIN,
            BUILD_DOMAIN,
            BUILD_RUN_DOMAIN,
        ]
        .iter()
        .any(|domain| key.starts_with(&format!("{domain}/")))
}

/// Label selector matching the jobs generated for a BuildRun. The generation
/// label is left out since cancelling a BuildRun bumps its generation.
pub fn job_selector(buildrun_name: &str) -> String {
    format!("{BUILD_RUN_NAME}={buildrun_name}")
}
