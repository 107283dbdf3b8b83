use std::str::FromStr;

use chrono::TimeDelta;
use prometheus_client::{
    metrics::{
        counter::Counter,
        family::{Family, MetricConstructor},
        histogram::Histogram,
    },
    registry::{Registry, Unit},
};

/// Label a BuildRun metric may carry, opted into with `PROMETHEUS_ENABLED_LABELS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricLabel {
    BuildStrategy,
    Namespace,
    Build,
    BuildRun,
}

impl MetricLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricLabel::BuildStrategy => "buildstrategy",
            MetricLabel::Namespace => "namespace",
            MetricLabel::Build => "build",
            MetricLabel::BuildRun => "buildrun",
        }
    }
}

impl FromStr for MetricLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "buildstrategy" => Ok(MetricLabel::BuildStrategy),
            "namespace" => Ok(MetricLabel::Namespace),
            "build" => Ok(MetricLabel::Build),
            "buildrun" => Ok(MetricLabel::BuildRun),
            other => Err(other.to_string()),
        }
    }
}

/// Identity of the BuildRun an observation belongs to.
#[derive(Clone, Copy, Debug)]
pub struct BuildRunLabels<'a> {
    pub strategy: &'a str,
    pub namespace: &'a str,
    pub build: &'a str,
    pub buildrun: &'a str,
}

type LabelSet = Vec<(String, String)>;

#[derive(Clone, Debug)]
struct Buckets(Vec<f64>);

impl MetricConstructor<Histogram> for Buckets {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.0.iter().copied())
    }
}

pub struct BucketConfig {
    pub completion: Vec<f64>,
    pub establish: Vec<f64>,
    pub rampup: Vec<f64>,
}

#[derive(Clone)]
pub struct BuildMetrics {
    enabled: Vec<MetricLabel>,
    completed: Family<LabelSet, Counter>,
    establish: Family<LabelSet, Histogram, Buckets>,
    completion: Family<LabelSet, Histogram, Buckets>,
    rampup: Family<LabelSet, Histogram, Buckets>,
    job_rampup: Family<LabelSet, Histogram, Buckets>,
    pod_rampup: Family<LabelSet, Histogram, Buckets>,
}

impl BuildMetrics {
    /// Creates the BuildRun metrics and registers them with `registry`.
    pub fn new(registry: &mut Registry, buckets: BucketConfig, enabled: Vec<MetricLabel>) -> Self {
        let histogram = |b: &[f64]| Family::new_with_constructor(Buckets(b.to_vec()));

        let metrics = Self {
            enabled,
            completed: Family::default(),
            establish: histogram(&buckets.establish),
            completion: histogram(&buckets.completion),
            rampup: histogram(&buckets.rampup),
            job_rampup: histogram(&buckets.rampup),
            pod_rampup: histogram(&buckets.rampup),
        };

        registry.register(
            "build_buildruns_completed",
            "Number of total completed buildruns.",
            metrics.completed.clone(),
        );
        registry.register_with_unit(
            "build_buildrun_establish_duration",
            "BuildRun establish duration in seconds.",
            Unit::Seconds,
            metrics.establish.clone(),
        );
        registry.register_with_unit(
            "build_buildrun_completion_duration",
            "BuildRun completion duration in seconds.",
            Unit::Seconds,
            metrics.completion.clone(),
        );
        registry.register_with_unit(
            "build_buildrun_rampup_duration",
            "BuildRun ramp-up duration in seconds (time between buildrun creation and taskrun creation).",
            Unit::Seconds,
            metrics.rampup.clone(),
        );
        registry.register_with_unit(
            "build_buildrun_taskrun_rampup_duration",
            "BuildRun taskrun ramp-up duration in seconds (time between taskrun creation and taskrun pod creation).",
            Unit::Seconds,
            metrics.job_rampup.clone(),
        );
        registry.register_with_unit(
            "build_buildrun_taskrun_pod_rampup_duration",
            "BuildRun taskrun pod ramp-up duration in seconds (time between pod creation and last init container completion).",
            Unit::Seconds,
            metrics.pod_rampup.clone(),
        );

        metrics
    }

    fn label_set(&self, labels: &BuildRunLabels<'_>) -> LabelSet {
        self.enabled
            .iter()
            .map(|label| {
                let value = match label {
                    MetricLabel::BuildStrategy => labels.strategy,
                    MetricLabel::Namespace => labels.namespace,
                    MetricLabel::Build => labels.build,
                    MetricLabel::BuildRun => labels.buildrun,
                };
                (label.as_str().to_string(), value.to_string())
            })
            .collect()
    }

    pub fn completed_inc(&self, labels: &BuildRunLabels<'_>) {
        self.completed.get_or_create(&self.label_set(labels)).inc();
    }

    pub fn establish_observe(&self, labels: &BuildRunLabels<'_>, duration: TimeDelta) {
        observe(&self.establish, self.label_set(labels), duration);
    }

    pub fn completion_observe(&self, labels: &BuildRunLabels<'_>, duration: TimeDelta) {
        observe(&self.completion, self.label_set(labels), duration);
    }

    pub fn rampup_observe(&self, labels: &BuildRunLabels<'_>, duration: TimeDelta) {
        observe(&self.rampup, self.label_set(labels), duration);
    }

    pub fn job_rampup_observe(&self, labels: &BuildRunLabels<'_>, duration: TimeDelta) {
        observe(&self.job_rampup, self.label_set(labels), duration);
    }

    pub fn pod_rampup_observe(&self, labels: &BuildRunLabels<'_>, duration: TimeDelta) {
        observe(&self.pod_rampup, self.label_set(labels), duration);
    }
}

fn observe(family: &Family<LabelSet, Histogram, Buckets>, labels: LabelSet, duration: TimeDelta) {
    let seconds = duration.num_milliseconds().max(0) as f64 / 1000.0;
    family.get_or_create(&labels).observe(seconds);
}
