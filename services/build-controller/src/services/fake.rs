//! In-memory [`ClusterClient`] for reconciler tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use build_core::{
    crds::{
        Build, BuildRun, BuildStrategy, ClusterBuildStrategy, PipelineRun, TaskRun,
        common::utc_to_time,
        tekton::{PIPELINE_RUN_SPEC_STATUS_CANCELLED, TASK_RUN_SPEC_STATUS_CANCELLED},
    },
    labels,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use kube::{Resource, ResourceExt};

use crate::{error::AppError, services::cluster::ClusterClient};

/// A mutating call the reconciler issued, with the object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    UpdateBuildRun(String),
    UpdateBuildRunStatus(String),
    DeleteBuildRun(String),
    CreateServiceAccount(String),
    UpdateServiceAccount(String),
    DeleteServiceAccount(String),
    CreateTaskRun(String),
    CancelTaskRun(String),
    CreatePipelineRun(String),
    CancelPipelineRun(String),
}

type Key = (String, String);

#[derive(Default)]
struct State {
    buildruns: BTreeMap<Key, BuildRun>,
    builds: BTreeMap<Key, Build>,
    build_strategies: BTreeMap<Key, BuildStrategy>,
    cluster_build_strategies: BTreeMap<String, ClusterBuildStrategy>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    pods: BTreeMap<Key, Pod>,
    task_runs: BTreeMap<Key, TaskRun>,
    pipeline_runs: BTreeMap<Key, PipelineRun>,
    calls: Vec<Call>,
    failing: HashSet<&'static str>,
    generated: usize,
}

#[derive(Default)]
pub struct FakeClient {
    state: Mutex<State>,
}

fn key<K: Resource>(object: &K) -> Key {
    (object.namespace().unwrap_or_default(), object.name_any())
}

fn owned(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// A TaskRun labelled as the job of `buildrun`.
pub fn task_run(namespace: &str, name: &str, buildrun: &str) -> TaskRun {
    let mut tr = TaskRun::new(name, Default::default());
    tr.metadata.namespace = Some(namespace.to_string());
    tr.labels_mut()
        .insert(labels::BUILD_RUN_NAME.to_string(), buildrun.to_string());
    tr
}

impl FakeClient {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Makes every later call of `operation` fail.
    pub fn fail_on(&self, operation: &'static str) {
        self.with(|s| s.failing.insert(operation));
    }

    /// Lets `operation` succeed again.
    pub fn recover(&self, operation: &'static str) {
        self.with(|s| s.failing.remove(operation));
    }

    fn check(&self, operation: &'static str) -> Result<(), AppError> {
        if self.with(|s| s.failing.contains(operation)) {
            return Err(AppError::InternalServerError(format!("{operation} failed")));
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.with(|s| s.calls.push(call));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn insert_buildrun(&self, buildrun: BuildRun) {
        self.with(|s| s.buildruns.insert(key(&buildrun), buildrun));
    }

    pub fn buildrun(&self, namespace: &str, name: &str) -> Option<BuildRun> {
        self.with(|s| s.buildruns.get(&owned(namespace, name)).cloned())
    }

    pub fn insert_build(&self, build: Build) {
        self.with(|s| s.builds.insert(key(&build), build));
    }

    pub fn insert_build_strategy(&self, strategy: BuildStrategy) {
        self.with(|s| s.build_strategies.insert(key(&strategy), strategy));
    }

    pub fn insert_cluster_build_strategy(&self, strategy: ClusterBuildStrategy) {
        self.with(|s| {
            s.cluster_build_strategies
                .insert(strategy.name_any(), strategy)
        });
    }

    pub fn insert_service_account(&self, sa: ServiceAccount) {
        self.with(|s| s.service_accounts.insert(key(&sa), sa));
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.with(|s| s.pods.insert(key(&pod), pod));
    }

    pub fn insert_task_run(&self, task_run: TaskRun) {
        self.with(|s| s.task_runs.insert(key(&task_run), task_run));
    }

    pub fn task_runs(&self) -> Vec<TaskRun> {
        self.with(|s| s.task_runs.values().cloned().collect())
    }

    pub fn insert_pipeline_run(&self, pipeline_run: PipelineRun) {
        self.with(|s| s.pipeline_runs.insert(key(&pipeline_run), pipeline_run));
    }

    pub fn pipeline_runs(&self) -> Vec<PipelineRun> {
        self.with(|s| s.pipeline_runs.values().cloned().collect())
    }

    /// Names a created object the way the API server resolves `generateName`.
    fn materialize<K: Resource>(&self, object: &mut K) {
        let n = self.with(|s| {
            s.generated += 1;
            s.generated
        });
        let meta = object.meta_mut();
        if meta.name.is_none() {
            meta.name = Some(format!("{}{n:05}", meta.generate_name.clone().unwrap_or_default()));
        }
        meta.creation_timestamp = utc_to_time(Utc::now());
        meta.uid = Some(format!("uid-{n}"));
    }
}

fn selected<K: Resource>(object: &K, selector: &str) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => object.labels().get(k).is_some_and(|value| value == v),
        None => object.labels().contains_key(term),
    })
}

impl ClusterClient for FakeClient {
    async fn get_buildrun(&self, namespace: &str, name: &str) -> Result<Option<BuildRun>, AppError> {
        self.check("get_buildrun")?;
        Ok(self.buildrun(namespace, name))
    }

    async fn update_buildrun(&self, buildrun: &BuildRun) -> Result<BuildRun, AppError> {
        self.check("update_buildrun")?;
        self.record(Call::UpdateBuildRun(buildrun.name_any()));
        self.insert_buildrun(buildrun.clone());
        Ok(buildrun.clone())
    }

    async fn update_buildrun_status(&self, buildrun: &BuildRun) -> Result<BuildRun, AppError> {
        self.check("update_buildrun_status")?;
        self.record(Call::UpdateBuildRunStatus(buildrun.name_any()));
        self.insert_buildrun(buildrun.clone());
        Ok(buildrun.clone())
    }

    async fn list_buildruns(&self, namespace: &str, selector: &str) -> Result<Vec<BuildRun>, AppError> {
        self.check("list_buildruns")?;
        Ok(self.with(|s| {
            s.buildruns
                .values()
                .filter(|br| br.namespace().as_deref() == Some(namespace))
                .filter(|br| selected(*br, selector))
                .cloned()
                .collect()
        }))
    }

    async fn delete_buildrun(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        self.check("delete_buildrun")?;
        self.record(Call::DeleteBuildRun(name.to_string()));
        self.with(|s| s.buildruns.remove(&owned(namespace, name)));
        Ok(())
    }

    async fn get_build(&self, namespace: &str, name: &str) -> Result<Option<Build>, AppError> {
        self.check("get_build")?;
        Ok(self.with(|s| s.builds.get(&owned(namespace, name)).cloned()))
    }

    async fn get_build_strategy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildStrategy>, AppError> {
        self.check("get_build_strategy")?;
        Ok(self.with(|s| s.build_strategies.get(&owned(namespace, name)).cloned()))
    }

    async fn get_cluster_build_strategy(
        &self,
        name: &str,
    ) -> Result<Option<ClusterBuildStrategy>, AppError> {
        self.check("get_cluster_build_strategy")?;
        Ok(self.with(|s| s.cluster_build_strategies.get(name).cloned()))
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, AppError> {
        self.check("get_service_account")?;
        Ok(self.with(|s| s.service_accounts.get(&owned(namespace, name)).cloned()))
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, AppError> {
        self.check("create_service_account")?;
        self.record(Call::CreateServiceAccount(sa.name_any()));
        self.insert_service_account(sa.clone());
        Ok(sa.clone())
    }

    async fn update_service_account(&self, sa: &ServiceAccount) -> Result<ServiceAccount, AppError> {
        self.check("update_service_account")?;
        self.record(Call::UpdateServiceAccount(sa.name_any()));
        self.insert_service_account(sa.clone());
        Ok(sa.clone())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        self.check("delete_service_account")?;
        self.record(Call::DeleteServiceAccount(name.to_string()));
        self.with(|s| s.service_accounts.remove(&owned(namespace, name)));
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, AppError> {
        self.check("get_pod")?;
        Ok(self.with(|s| s.pods.get(&owned(namespace, name)).cloned()))
    }

    async fn get_task_run(&self, namespace: &str, name: &str) -> Result<Option<TaskRun>, AppError> {
        self.check("get_task_run")?;
        Ok(self.with(|s| s.task_runs.get(&owned(namespace, name)).cloned()))
    }

    async fn list_task_runs(&self, namespace: &str, selector: &str) -> Result<Vec<TaskRun>, AppError> {
        self.check("list_task_runs")?;
        Ok(self.with(|s| {
            s.task_runs
                .values()
                .filter(|tr| tr.namespace().as_deref() == Some(namespace))
                .filter(|tr| selected(*tr, selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_task_run(&self, task_run: &TaskRun) -> Result<TaskRun, AppError> {
        self.check("create_task_run")?;
        let mut task_run = task_run.clone();
        self.materialize(&mut task_run);
        self.record(Call::CreateTaskRun(task_run.name_any()));
        self.insert_task_run(task_run.clone());
        Ok(task_run)
    }

    async fn cancel_task_run(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        self.check("cancel_task_run")?;
        self.record(Call::CancelTaskRun(name.to_string()));
        self.with(|s| {
            if let Some(tr) = s.task_runs.get_mut(&owned(namespace, name)) {
                tr.spec.status = Some(TASK_RUN_SPEC_STATUS_CANCELLED.to_string());
            }
        });
        Ok(())
    }

    async fn get_pipeline_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PipelineRun>, AppError> {
        self.check("get_pipeline_run")?;
        Ok(self.with(|s| s.pipeline_runs.get(&owned(namespace, name)).cloned()))
    }

    async fn list_pipeline_runs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PipelineRun>, AppError> {
        self.check("list_pipeline_runs")?;
        Ok(self.with(|s| {
            s.pipeline_runs
                .values()
                .filter(|pr| pr.namespace().as_deref() == Some(namespace))
                .filter(|pr| selected(*pr, selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_pipeline_run(&self, pipeline_run: &PipelineRun) -> Result<PipelineRun, AppError> {
        self.check("create_pipeline_run")?;
        let mut pipeline_run = pipeline_run.clone();
        self.materialize(&mut pipeline_run);
        self.record(Call::CreatePipelineRun(pipeline_run.name_any()));
        self.insert_pipeline_run(pipeline_run.clone());
        Ok(pipeline_run)
    }

    async fn cancel_pipeline_run(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        self.check("cancel_pipeline_run")?;
        self.record(Call::CancelPipelineRun(name.to_string()));
        self.with(|s| {
            if let Some(pr) = s.pipeline_runs.get_mut(&owned(namespace, name)) {
                pr.spec.status = Some(PIPELINE_RUN_SPEC_STATUS_CANCELLED.to_string());
            }
        });
        Ok(())
    }
}
