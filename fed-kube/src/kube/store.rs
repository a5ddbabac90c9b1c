use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use serde_json::Value;

use crate::client::ClientError;

use super::types::QualifiedName;

/// Generic CRUD access to objects of any kind, keyed by
/// (api resource, namespace, name).
///
/// Implemented by [`crate::client::KubeClient`] against a real API server and
/// by in-memory fakes in tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists objects in `namespace`, or across all namespaces when `None`.
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError>;

    async fn get(
        &self,
        ar: &ApiResource,
        name: &QualifiedName,
    ) -> Result<Option<DynamicObject>, ClientError>;

    async fn create(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Replaces the object. The resource version carried by `object` is the
    /// optimistic-concurrency token.
    async fn update(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Replaces the status subresource only.
    async fn update_status(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    async fn patch_merge(
        &self,
        ar: &ApiResource,
        name: &QualifiedName,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError>;
}
