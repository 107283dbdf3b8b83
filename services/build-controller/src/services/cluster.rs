use std::{future::Future, sync::Arc};

use build_core::crds::{
    Build, BuildRun, BuildStrategy, ClusterBuildStrategy, PipelineRun, TaskRun,
    tekton::{PIPELINE_RUN_SPEC_STATUS_CANCELLED, TASK_RUN_SPEC_STATUS_CANCELLED},
};
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;

use crate::{error::AppError, services::throttle::Throttle};

const FIELD_MANAGER: &str = "build-controller";

/// Every cluster call the BuildRun reconciler makes. Reads of a single object
/// return `None` when it does not exist.
pub trait ClusterClient: Send + Sync + 'static {
    fn get_buildrun(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<BuildRun>, AppError>> + Send;

    /// Replaces labels and owner references.
    fn update_buildrun(
        &self,
        buildrun: &BuildRun,
    ) -> impl Future<Output = Result<BuildRun, AppError>> + Send;

    /// Writes the status subresource, failing on a stale resourceVersion.
    fn update_buildrun_status(
        &self,
        buildrun: &BuildRun,
    ) -> impl Future<Output = Result<BuildRun, AppError>> + Send;

    fn list_buildruns(
        &self,
        namespace: &str,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<BuildRun>, AppError>> + Send;

    /// Deleting a BuildRun that is already gone succeeds.
    fn delete_buildrun(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_build(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Build>, AppError>> + Send;

    fn get_build_strategy(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<BuildStrategy>, AppError>> + Send;

    fn get_cluster_build_strategy(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<ClusterBuildStrategy>, AppError>> + Send;

    fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<ServiceAccount>, AppError>> + Send;

    fn create_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> impl Future<Output = Result<ServiceAccount, AppError>> + Send;

    fn update_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> impl Future<Output = Result<ServiceAccount, AppError>> + Send;

    /// Deleting a ServiceAccount that is already gone succeeds.
    fn delete_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Pod>, AppError>> + Send;

    fn get_task_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<TaskRun>, AppError>> + Send;

    fn list_task_runs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<TaskRun>, AppError>> + Send;

    fn create_task_run(
        &self,
        task_run: &TaskRun,
    ) -> impl Future<Output = Result<TaskRun, AppError>> + Send;

    fn cancel_task_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_pipeline_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<PipelineRun>, AppError>> + Send;

    fn list_pipeline_runs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<PipelineRun>, AppError>> + Send;

    fn create_pipeline_run(
        &self,
        pipeline_run: &PipelineRun,
    ) -> impl Future<Output = Result<PipelineRun, AppError>> + Send;

    fn cancel_pipeline_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// [`ClusterClient`] backed by the API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    throttle: Arc<Throttle>,
}

impl KubeClusterClient {
    pub fn new(client: Client, throttle: Throttle) -> Self {
        Self {
            client,
            throttle: Arc::new(throttle),
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, api: Api<K>, name: &str) -> Result<Option<K>, AppError>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        self.throttle.acquire().await;
        Ok(api.get_opt(name).await?)
    }

    async fn list<K>(&self, api: Api<K>, selector: &str) -> Result<Vec<K>, AppError>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        self.throttle.acquire().await;
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create<K>(&self, api: Api<K>, object: &K) -> Result<K, AppError>
    where
        K: Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        self.throttle.acquire().await;
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn replace<K>(&self, api: Api<K>, object: &K) -> Result<K, AppError>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        self.throttle.acquire().await;
        Ok(api
            .replace(&object.name_any(), &PostParams::default(), object)
            .await?)
    }

    async fn delete<K>(&self, api: Api<K>, name: &str) -> Result<(), AppError>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        self.throttle.acquire().await;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Server-side apply of `spec.status`, the cooperative way to stop a
    /// Tekton run.
    async fn cancel<K>(&self, api: Api<K>, name: &str, status: &str) -> Result<(), AppError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let patch = json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "metadata": { "name": name },
            "spec": { "status": status },
        });

        self.throttle.acquire().await;
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(())
    }
}

impl ClusterClient for KubeClusterClient {
    async fn get_buildrun(&self, namespace: &str, name: &str) -> Result<Option<BuildRun>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn update_buildrun(&self, buildrun: &BuildRun) -> Result<BuildRun, AppError> {
        let namespace = buildrun.namespace().unwrap_or_default();
        self.replace(self.namespaced(&namespace), buildrun).await
    }

    async fn update_buildrun_status(&self, buildrun: &BuildRun) -> Result<BuildRun, AppError> {
        let namespace = buildrun.namespace().unwrap_or_default();
        let api: Api<BuildRun> = self.namespaced(&namespace);

        // resourceVersion makes the merge patch conditional
        let patch = json!({
            "metadata": { "resourceVersion": buildrun.resource_version() },
            "status": buildrun.status,
        });

        self.throttle.acquire().await;
        let updated = api
            .patch_status(
                &buildrun.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(buildrun = %buildrun.name_any(), "📝 BuildRun status written");
        Ok(updated)
    }

    async fn list_buildruns(&self, namespace: &str, selector: &str) -> Result<Vec<BuildRun>, AppError> {
        self.list(self.namespaced(namespace), selector).await
    }

    async fn delete_buildrun(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        let api: Api<BuildRun> = self.namespaced(namespace);
        self.delete(api, name).await
    }

    async fn get_build(&self, namespace: &str, name: &str) -> Result<Option<Build>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn get_build_strategy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildStrategy>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn get_cluster_build_strategy(
        &self,
        name: &str,
    ) -> Result<Option<ClusterBuildStrategy>, AppError> {
        self.get_opt(Api::all(self.client.clone()), name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn create_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount, AppError> {
        let namespace = service_account.namespace().unwrap_or_default();
        self.create(self.namespaced(&namespace), service_account).await
    }

    async fn update_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount, AppError> {
        let namespace = service_account.namespace().unwrap_or_default();
        self.replace(self.namespaced(&namespace), service_account)
            .await
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        self.delete(api, name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn get_task_run(&self, namespace: &str, name: &str) -> Result<Option<TaskRun>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn list_task_runs(&self, namespace: &str, selector: &str) -> Result<Vec<TaskRun>, AppError> {
        self.list(self.namespaced(namespace), selector).await
    }

    async fn create_task_run(&self, task_run: &TaskRun) -> Result<TaskRun, AppError> {
        let namespace = task_run.namespace().unwrap_or_default();
        self.create(self.namespaced(&namespace), task_run).await
    }

    async fn cancel_task_run(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        let api: Api<TaskRun> = self.namespaced(namespace);
        self.cancel(api, name, TASK_RUN_SPEC_STATUS_CANCELLED).await
    }

    async fn get_pipeline_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PipelineRun>, AppError> {
        self.get_opt(self.namespaced(namespace), name).await
    }

    async fn list_pipeline_runs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PipelineRun>, AppError> {
        self.list(self.namespaced(namespace), selector).await
    }

    async fn create_pipeline_run(&self, pipeline_run: &PipelineRun) -> Result<PipelineRun, AppError> {
        let namespace = pipeline_run.namespace().unwrap_or_default();
        self.create(self.namespaced(&namespace), pipeline_run).await
    }

    async fn cancel_pipeline_run(&self, namespace: &str, name: &str) -> Result<(), AppError> {
        let api: Api<PipelineRun> = self.namespaced(namespace);
        self.cancel(api, name, PIPELINE_RUN_SPEC_STATUS_CANCELLED)
            .await
    }
}
