use std::future::Future;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams, PostParams},
    core::ErrorResponse,
};
use serde_json::json;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};

use crate::crds::{DeploymentSync, DeploymentSyncStatus, SchemaError};

/// Namespace and name of a `DeploymentSync`, as delivered by the work queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IntentKey {
    pub namespace: String,
    pub name: String,
}

impl IntentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for IntentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("write conflict")]
    Conflict,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("deadline elapsed before the request completed")]
    Cancelled,

    #[error("api error: {0}")]
    Api(kube::Error),
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ErrorResponse { code: 404, .. }) => StoreError::NotFound,
            kube::Error::Api(ErrorResponse { code: 409, .. }) => StoreError::Conflict,
            kube::Error::SerdeError(e) => SchemaError::Malformed(e.to_string()).into(),
            e => StoreError::Api(e),
        }
    }
}

/// Runs a store request, failing with [`StoreError::Cancelled`] once `deadline` passes.
pub async fn with_deadline<T>(
    deadline: Instant,
    request: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    timeout_at(deadline, request)
        .await
        .unwrap_or(Err(StoreError::Cancelled))
}

/// The object-store operations the reconciler depends on.
///
/// Implementations must surface "not found" and optimistic-concurrency
/// failures as [`StoreError::NotFound`] and [`StoreError::Conflict`] so the
/// reconciler can branch on them.
pub trait SyncStore: Send + Sync {
    fn get_intent(
        &self,
        key: &IntentKey,
    ) -> impl Future<Output = Result<DeploymentSync, StoreError>> + Send;

    fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Deployment, StoreError>> + Send;

    fn create_deployment(
        &self,
        deployment: &Deployment,
    ) -> impl Future<Output = Result<Deployment, StoreError>> + Send;

    /// Replaces the Deployment, guarded by its `metadata.resourceVersion`.
    fn update_deployment(
        &self,
        deployment: &Deployment,
    ) -> impl Future<Output = Result<Deployment, StoreError>> + Send;

    fn update_intent_status(
        &self,
        intent: &DeploymentSync,
        status: &DeploymentSyncStatus,
    ) -> impl Future<Output = Result<DeploymentSync, StoreError>> + Send;
}

/// [`SyncStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn intents(&self, namespace: &str) -> Api<DeploymentSync> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl SyncStore for KubeStore {
    async fn get_intent(&self, key: &IntentKey) -> Result<DeploymentSync, StoreError> {
        let intent = self.intents(&key.namespace).get(&key.name).await?;
        intent.spec.validate()?;
        Ok(intent)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        Ok(self.deployments(namespace).get(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let namespace = deployment.namespace().unwrap_or_default();
        Ok(self
            .deployments(&namespace)
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let namespace = deployment.namespace().unwrap_or_default();
        Ok(self
            .deployments(&namespace)
            .replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?)
    }

    async fn update_intent_status(
        &self,
        intent: &DeploymentSync,
        status: &DeploymentSyncStatus,
    ) -> Result<DeploymentSync, StoreError> {
        let namespace = intent.namespace().unwrap_or_default();
        let patch = Patch::Merge(json!({ "status": status }));
        Ok(self
            .intents(&namespace)
            .patch_status(&intent.name_any(), &PatchParams::default(), &patch)
            .await?)
    }
}
