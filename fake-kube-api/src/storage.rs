use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use fedkube::client::ClientError;
use fedkube::kube::dynamic_object_ext::DynamicObjectExt;
use fedkube::kube::store::ObjectStore;
use fedkube::kube::types::QualifiedName;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    UpdateStatus,
    PatchMerge,
}

/// Error returned instead of performing the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    AlreadyExists,
    Conflict,
    Forbidden,
    Unavailable,
}

impl Fault {
    fn to_error(self, operation: Operation) -> ClientError {
        let message = format!("injected fault on {operation:?}");
        match self {
            Fault::NotFound => ClientError::NotFound(message),
            Fault::AlreadyExists => ClientError::AlreadyExists(message),
            Fault::Conflict => ClientError::VersionConflict(message),
            Fault::Forbidden => ClientError::Forbidden(message),
            Fault::Unavailable => ClientError::Invariant(anyhow!(message)),
        }
    }
}

/// In-memory object store with API server style resource versions and
/// optimistic concurrency.
///
/// Every call is counted per operation (`attempts`), successful writes
/// separately (`successes`). Faults queued with [`FakeObjectStore::fail_next`]
/// are returned in order before the store is consulted. Calls on an object
/// held with [`FakeObjectStore::hold`] wait until it is released.
pub struct FakeObjectStore {
    resources: DashMap<GroupVersionKind, DashMap<QualifiedName, DynamicObject>>,
    resource_versions: AtomicU64,
    resource_uids: AtomicU64,
    attempts: DashMap<Operation, u64>,
    successes: DashMap<Operation, u64>,
    faults: Mutex<VecDeque<(Operation, Fault)>>,
    holds: DashMap<(Operation, QualifiedName), watch::Receiver<bool>>,
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        FakeObjectStore::new()
    }
}

impl FakeObjectStore {
    pub fn new() -> FakeObjectStore {
        FakeObjectStore {
            resources: DashMap::new(),
            resource_versions: AtomicU64::new(1),
            resource_uids: AtomicU64::new(1),
            attempts: DashMap::new(),
            successes: DashMap::new(),
            faults: Mutex::new(VecDeque::new()),
            holds: DashMap::new(),
        }
    }

    /// Stores an object directly, as if written by another process.
    pub fn insert(&self, ar: &ApiResource, mut object: DynamicObject) -> DynamicObject {
        let name = object.get_qualified_name();
        self.stamp(&mut object, true);
        self.kind(ar).insert(name, object.clone());
        object
    }

    pub fn remove(&self, ar: &ApiResource, name: &QualifiedName) -> Option<DynamicObject> {
        self.kind(ar).remove(name).map(|(_, object)| object)
    }

    pub fn stored(&self, ar: &ApiResource, name: &QualifiedName) -> Option<DynamicObject> {
        self.kind(ar).get(name).map(|entry| entry.value().clone())
    }

    pub fn count(&self, ar: &ApiResource) -> usize {
        self.kind(ar).len()
    }

    pub fn fail_next(&self, operation: Operation, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back((operation, fault));
        }
    }

    /// Holds calls of `operation` on `name` until the returned sender is set
    /// to `true` or dropped.
    pub fn hold(&self, operation: Operation, name: &QualifiedName) -> watch::Sender<bool> {
        let (release, held) = watch::channel(false);
        self.holds.insert((operation, name.clone()), held);
        release
    }

    pub fn attempts(&self, operation: Operation) -> u64 {
        self.attempts.get(&operation).map(|v| *v).unwrap_or(0)
    }

    pub fn successes(&self, operation: Operation) -> u64 {
        self.successes.get(&operation).map(|v| *v).unwrap_or(0)
    }

    /// Successful create, update and status update calls.
    pub fn writes(&self) -> u64 {
        [
            Operation::Create,
            Operation::Update,
            Operation::UpdateStatus,
            Operation::PatchMerge,
        ]
        .into_iter()
        .map(|op| self.successes(op))
        .sum()
    }

    fn kind(
        &self,
        ar: &ApiResource,
    ) -> dashmap::mapref::one::RefMut<'_, GroupVersionKind, DashMap<QualifiedName, DynamicObject>>
    {
        let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
        self.resources.entry(gvk).or_default()
    }

    fn enter(&self, operation: Operation) -> Result<(), ClientError> {
        *self.attempts.entry(operation).or_default() += 1;
        let fault = self.faults.lock().ok().and_then(|mut faults| {
            let position = faults.iter().position(|(op, _)| *op == operation)?;
            faults.remove(position).map(|(_, fault)| fault)
        });
        match fault {
            Some(fault) => {
                debug!("Injecting {fault:?} into {operation:?}");
                Err(fault.to_error(operation))
            }
            None => Ok(()),
        }
    }

    async fn wait_released(&self, operation: Operation, name: &QualifiedName) {
        let held = self
            .holds
            .get(&(operation, name.clone()))
            .map(|entry| entry.value().clone());
        if let Some(mut held) = held {
            debug!("{operation:?} on {name} held");
            if held.wait_for(|released| *released).await.is_err() {
                debug!("Hold on {name} dropped");
            }
        }
    }

    fn succeed(&self, operation: Operation) {
        *self.successes.entry(operation).or_default() += 1;
    }

    fn stamp(&self, object: &mut DynamicObject, new_uid: bool) {
        let version = self.resource_versions.fetch_add(1, Ordering::SeqCst);
        object.metadata.resource_version = Some(version.to_string());
        if new_uid && object.metadata.uid.is_none() {
            let uid = self.resource_uids.fetch_add(1, Ordering::SeqCst);
            object.metadata.uid = Some(format!("uid-{uid}"));
        }
    }

    fn check_version(stored: &DynamicObject, incoming: &DynamicObject) -> Result<(), ClientError> {
        match incoming.get_resource_version() {
            Some(version) if Some(&version) != stored.metadata.resource_version.as_ref() => {
                Err(ClientError::VersionConflict(format!(
                    "{} has resource version {:?}, got {version}",
                    stored.get_qualified_name(),
                    stored.metadata.resource_version
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        self.enter(Operation::List)?;
        let mut objects: Vec<DynamicObject> = self
            .kind(ar)
            .iter()
            .filter(|entry| namespace.is_none() || entry.key().namespace() == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        objects.sort_by_key(|object| object.get_qualified_name());
        self.succeed(Operation::List);
        Ok(objects)
    }

    async fn get(
        &self,
        ar: &ApiResource,
        name: &QualifiedName,
    ) -> Result<Option<DynamicObject>, ClientError> {
        self.enter(Operation::Get)?;
        let object = self.stored(ar, name);
        self.succeed(Operation::Get);
        Ok(object)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        self.enter(Operation::Create)?;
        let name = object.get_qualified_name();
        self.wait_released(Operation::Create, &name).await;
        let kind = self.kind(ar);
        if kind.contains_key(&name) {
            return Err(ClientError::AlreadyExists(format!("{name} already exists")));
        }
        let mut created = object.clone();
        if let Some(data) = created.data.as_object_mut() {
            data.remove("status");
        }
        self.stamp(&mut created, true);
        kind.insert(name, created.clone());
        self.succeed(Operation::Create);
        Ok(created)
    }

    async fn update(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        self.enter(Operation::Update)?;
        let name = object.get_qualified_name();
        self.wait_released(Operation::Update, &name).await;
        let kind = self.kind(ar);
        let mut stored = kind
            .get_mut(&name)
            .ok_or_else(|| ClientError::NotFound(format!("{name} not found")))?;
        Self::check_version(&stored, object)?;

        let mut updated = object.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        self.stamp(&mut updated, false);
        *stored = updated.clone();
        self.succeed(Operation::Update);
        Ok(updated)
    }

    async fn update_status(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        self.enter(Operation::UpdateStatus)?;
        let name = object.get_qualified_name();
        self.wait_released(Operation::UpdateStatus, &name).await;
        let kind = self.kind(ar);
        let mut stored = kind
            .get_mut(&name)
            .ok_or_else(|| ClientError::NotFound(format!("{name} not found")))?;
        Self::check_version(&stored, object)?;

        let status = object.data.get("status").cloned().unwrap_or(Value::Null);
        let mut updated = stored.clone();
        match updated.data.as_object_mut() {
            Some(data) => {
                data.insert("status".into(), status);
            }
            None => updated.data = serde_json::json!({ "status": status }),
        }
        self.stamp(&mut updated, false);
        *stored = updated.clone();
        self.succeed(Operation::UpdateStatus);
        Ok(updated)
    }

    async fn patch_merge(
        &self,
        ar: &ApiResource,
        name: &QualifiedName,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        self.enter(Operation::PatchMerge)?;
        let kind = self.kind(ar);
        let mut stored = kind
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(format!("{name} not found")))?;

        let mut updated = stored.clone();
        let mut data_patch = patch.clone();
        if let Some(fields) = data_patch.as_object_mut() {
            fields.remove("metadata");
        }
        merge_patch(&mut updated.data, &data_patch);
        self.stamp(&mut updated, false);
        *stored = updated.clone();
        self.succeed(Operation::PatchMerge);
        Ok(updated)
    }
}

// JSON merge patch: objects merge recursively, null removes a field,
// anything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in fields {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
