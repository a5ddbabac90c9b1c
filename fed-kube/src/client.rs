use crate::config::KubeConfiguration;
use crate::kube::store::ObjectStore;
use crate::kube::types::QualifiedName;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use kube::api::{ApiResource, ListParams, PostParams};
use kube::config::{InferConfigError, KubeconfigError};
use kube::core::dynamic::ParseDynamicObjectError;
use kube::{
    Api,
    api::{DynamicObject, GroupVersionKind, Patch, PatchParams},
    runtime::watcher::{self, Event},
};
use serde_json::{Value, json};
use tracing::{debug, error};

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Configuration Error: {0}")]
    Configuration(#[from] BoxedError),

    #[error("Kube Error: {0}")]
    Kube(kube::Error),

    #[error("Invariant Error: {0}")]
    Invariant(#[from] anyhow::Error),

    #[error("Resource Format Error: {0}")]
    ResourceFormatError(#[from] ParseDynamicObjectError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl ClientError {
    /// Maps an API status response onto the error taxonomy callers branch on.
    pub fn from_status(code: u16, reason: &str, message: String) -> Option<ClientError> {
        match (code, reason) {
            (404, _) => Some(ClientError::NotFound(message)),
            (409, "AlreadyExists") => Some(ClientError::AlreadyExists(message)),
            (409, _) => Some(ClientError::VersionConflict(message)),
            (403, _) => Some(ClientError::Forbidden(message)),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::VersionConflict(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClientError::Forbidden(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(error: kube::Error) -> Self {
        if let kube::Error::Api(response) = &error {
            if let Some(classified) = ClientError::from_status(
                response.code,
                response.reason.as_str(),
                response.message.to_owned(),
            ) {
                return classified;
            }
        }
        ClientError::Kube(error)
    }
}

impl From<InferConfigError> for ClientError {
    fn from(value: InferConfigError) -> Self {
        ClientError::Configuration(Box::new(value))
    }
}

impl From<KubeconfigError> for ClientError {
    fn from(value: KubeconfigError) -> Self {
        ClientError::Configuration(Box::new(value))
    }
}

#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    resources: DashMap<GroupVersionKind, ApiResource>,
}

impl KubeClient {
    pub async fn build(config: &KubeConfiguration) -> Result<KubeClient, ClientError> {
        let kube_config = KubeClient::to_kube_config(config).await?;
        let client = kube::Client::try_from(kube_config).context("failed to create kube client")?;
        Ok(KubeClient::from_client(client))
    }

    pub fn from_client(client: kube::Client) -> KubeClient {
        KubeClient {
            client,
            resources: DashMap::new(),
        }
    }

    async fn to_kube_config(
        config: &KubeConfiguration,
    ) -> Result<kube::config::Config, ClientError> {
        match &config {
            KubeConfiguration::InCluster => {
                kube::config::Config::infer().await.map_err(|e| e.into())
            }
            KubeConfiguration::External(external_config) => {
                let kube_context = external_config
                    .kube_context
                    .to_owned()
                    .unwrap_or("default".into());
                let options = kube::config::KubeConfigOptions {
                    context: Some(kube_context),
                    ..Default::default()
                };
                match &external_config.kubeconfig {
                    Some(path) => {
                        let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
                        kube::config::Config::from_custom_kubeconfig(kubeconfig, &options)
                            .await
                            .map_err(|e| e.into())
                    }
                    None => kube::config::Config::from_kubeconfig(&options)
                        .await
                        .map_err(|e| e.into()),
                }
            }
        }
    }

    /// Resolves the api resource of a kind through discovery, caching the
    /// answer per client.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource, ClientError> {
        if !self.resources.contains_key(gvk) {
            let (ar, _) = kube::discovery::pinned_kind(&self.client, gvk).await?;
            self.resources.insert(gvk.clone(), ar);
        }
        self.resources
            .get(gvk)
            .map(|resource| resource.value().to_owned())
            .ok_or(ClientError::Invariant(anyhow!(
                "Should not happend, resource not found in cache: {:?}",
                gvk
            )))
    }

    /// Probes the API server. Used for member cluster health checks.
    pub async fn is_healthy(&self) -> bool {
        match self.client.apiserver_version().await {
            Ok(_) => true,
            Err(err) => {
                debug!("API server health probe failed: {err}");
                false
            }
        }
    }

    fn api_for(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) if !namespace.is_empty() => {
                Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, ar)
            }
            _ => Api::<DynamicObject>::all_with(self.client.clone(), ar),
        }
    }

    pub fn event_stream_for(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
    ) -> impl Stream<Item = Result<Event<DynamicObject>, watcher::Error>> + Send + use<> {
        let api = self.api_for(ar, namespace);
        let wc = watcher::Config::default();
        watcher::watcher(api, wc)
    }
}

#[async_trait]
impl ObjectStore for KubeClient {
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let list_params = ListParams::default();
        let results = self
            .api_for(ar, namespace)
            .list(&list_params)
            .await
            .map(|list| list.items)?;
        Ok(results)
    }

    async fn get(
        &self,
        ar: &ApiResource,
        name: &QualifiedName,
    ) -> Result<Option<DynamicObject>, ClientError> {
        let result = self.api_for(ar, name.namespace()).get_opt(&name.name).await?;
        Ok(result)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let namespace = object.metadata.namespace.as_deref();
        let created = self
            .api_for(ar, namespace)
            .create(&PostParams::default(), object)
            .await
            .inspect_err(|err| debug!("create error {err:?}"))?;
        Ok(created)
    }

    async fn update(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let namespace = object.metadata.namespace.as_deref();
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("cannot update object without a name"))?;
        let updated = self
            .api_for(ar, namespace)
            .replace(name, &PostParams::default(), object)
            .await?;
        Ok(updated)
    }

    async fn update_status(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let namespace = object.metadata.namespace.as_deref();
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("cannot update status of object without a name"))?;

        // The resource version in the patch makes the API server reject
        // writes based on a stale copy.
        let status = json!({
            "metadata": { "resourceVersion": object.metadata.resource_version },
            "status": object.data.get("status").cloned().unwrap_or(Value::Null),
        });
        let updated = self
            .api_for(ar, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .inspect_err(|err| {
                if !matches!(err, kube::Error::Api(response) if response.code == 409) {
                    error!("patch status error {err:?}");
                }
            })?;
        Ok(updated)
    }

    async fn patch_merge(
        &self,
        ar: &ApiResource,
        name: &QualifiedName,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        let patched = self
            .api_for(ar, name.namespace())
            .patch(&name.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_api_status_codes() {
        assert!(ClientError::from_status(404, "NotFound", "gone".into()).is_some_and(|e| e.is_not_found()));
        assert!(
            ClientError::from_status(409, "AlreadyExists", "dup".into())
                .is_some_and(|e| e.is_already_exists())
        );
        assert!(ClientError::from_status(409, "Conflict", "stale".into()).is_some_and(|e| e.is_conflict()));
        assert!(
            ClientError::from_status(403, "Forbidden", "terminating".into())
                .is_some_and(|e| e.is_forbidden())
        );
        assert!(ClientError::from_status(500, "InternalError", "boom".into()).is_none());
    }
}
