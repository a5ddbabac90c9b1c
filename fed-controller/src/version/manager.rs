use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use fedkube::client::ClientError;
use fedkube::kube::cache::CacheReader;
use fedkube::kube::dynamic_object_ext::DynamicObjectExt;
use fedkube::kube::store::ObjectStore;
use fedkube::kube::types::QualifiedName;
use fedresource::propagatedversion::{
    ClusterObjectVersion, PropagatedVersionStatus, propagated_version_name,
    propagated_version_prefix, version_map_to_cluster_versions,
};
use kube::api::DynamicObject;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info};

use super::adapter::VersionAdapter;
use super::resource::VersionedResource;
use crate::metrics::{
    LABEL_RECORD_TYPE, LABEL_TARGET_KIND, VERSION_WRITE_ATTEMPT_TOTAL, VERSION_WRITE_FAILURE_TOTAL,
};
use crate::utils::poll::{Poll, poll_until};

const LIST_RETRY_DELAY: Duration = Duration::from_secs(1);
const WRITE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks, per federated resource, the version of the target object last
/// written to each member cluster.
///
/// Records live in memory, keyed by record name, and are persisted as
/// propagated version objects so they survive a restart.
pub struct VersionManager {
    target_kind: String,
    federated_kind: String,
    namespace: Option<String>,
    adapter: VersionAdapter,
    client: Arc<dyn ObjectStore>,
    cache: RwLock<VersionCache>,
}

#[derive(Default)]
struct VersionCache {
    has_synced: bool,
    versions: HashMap<QualifiedName, DynamicObject>,
}

#[derive(Default)]
struct WriteState {
    resource_version: Option<String>,
    refresh: bool,
}

impl VersionManager {
    pub fn new(
        client: Arc<dyn ObjectStore>,
        namespaced: bool,
        federated_kind: impl Into<String>,
        target_kind: impl Into<String>,
        namespace: Option<String>,
    ) -> VersionManager {
        VersionManager {
            target_kind: target_kind.into(),
            federated_kind: federated_kind.into(),
            namespace,
            adapter: VersionAdapter::new(namespaced),
            client,
            cache: RwLock::new(VersionCache::default()),
        }
    }

    /// Loads all persisted records of this target kind. Listing is retried
    /// until it succeeds or `cancelation` fires.
    pub async fn sync(&self, cancelation: CancellationToken) {
        let Some(records) = self.list(&cancelation).await else {
            return;
        };
        self.load(records).await;
    }

    pub async fn has_synced(&self) -> bool {
        self.cache.read().await.has_synced
    }

    /// Cluster name to version map recorded for `resource`. Empty when no
    /// record exists or the record was written for another template or
    /// override version.
    pub async fn get(&self, resource: &dyn VersionedResource) -> Result<BTreeMap<String, String>> {
        let template_version = resource
            .template_version()
            .context("Failed to determine template version")?;
        let override_version = resource
            .override_version()
            .context("Failed to determine override version")?;

        let name = self.version_name(&resource.federated_name());
        let status = {
            let cache = self.cache.read().await;
            match cache.versions.get(&name) {
                Some(record) => self.adapter.get_status(record)?,
                None => return Ok(BTreeMap::new()),
            }
        };

        if status.matches(&template_version, &override_version) {
            Ok(status.version_map())
        } else {
            Ok(BTreeMap::new())
        }
    }

    /// Records `new_versions` for `resource`.
    ///
    /// Versions of selected clusters missing from `new_versions` are kept,
    /// an empty version removes the cluster. Nothing is written when the
    /// result equals the existing record.
    pub async fn update(
        &self,
        resource: &dyn VersionedResource,
        selected_clusters: &[String],
        new_versions: BTreeMap<String, String>,
    ) -> Result<()> {
        let template_version = resource
            .template_version()
            .context("Failed to determine template version")?;
        let override_version = resource
            .override_version()
            .context("Failed to determine override version")?;
        let name = self.version_name(&resource.federated_name());

        let record = {
            let mut cache = self.cache.write().await;

            let (old_status, cluster_versions) = match cache.versions.get(&name) {
                Some(existing) => {
                    let old_status = self.adapter.get_status(existing)?;
                    let old_versions = if old_status.matches(&template_version, &override_version)
                    {
                        old_status.cluster_versions.as_slice()
                    } else {
                        &[]
                    };
                    let versions =
                        update_cluster_versions(old_versions, new_versions, selected_clusters);
                    (Some(old_status), versions)
                }
                None => (None, version_map_to_cluster_versions(&new_versions)),
            };

            let status =
                PropagatedVersionStatus::new(template_version, override_version, cluster_versions);

            if old_status.is_some_and(|old| old.equivalent(&status)) {
                debug!("No update necessary for {} {name}", self.adapter.type_name());
                return Ok(());
            }

            match cache.versions.get_mut(&name) {
                Some(record) => {
                    self.adapter.set_status(record, &status)?;
                    record.clone()
                }
                None => {
                    let owner = resource.object().get_owner_reference()?;
                    let record = self.adapter.new_version(&name, owner, &status)?;
                    cache.versions.insert(name.clone(), record.clone());
                    record
                }
            }
        };

        let resource_version = self.write_version(&record, &name).await?;

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.versions.get_mut(&name) {
            cached.set_resource_version(resource_version);
        }
        Ok(())
    }

    /// Forgets the record of a federated resource. The persisted record is
    /// owned by the federated resource and removed by garbage collection.
    pub async fn delete(&self, name: &QualifiedName) {
        let version_name = self.version_name(name);
        self.cache.write().await.versions.remove(&version_name);
    }

    /// Consumes change notifications of the federated cache and forgets the
    /// records of resources no longer in it. Every change is passed on to
    /// `downstream`.
    pub fn track_deletions(
        self: &Arc<Self>,
        federated: Arc<dyn CacheReader>,
        changes: loole::Receiver<QualifiedName>,
        downstream: Option<loole::Sender<QualifiedName>>,
        cancelation: CancellationToken,
    ) -> AbortOnDropHandle<()> {
        let manager = self.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = cancelation.cancelled() => break,
                    name = changes.recv_async() => match name {
                        Ok(name) => name,
                        Err(_) => break,
                    },
                };
                if federated.get(&name).is_none() {
                    debug!("{} {name} deleted, forgetting its versions", manager.federated_kind);
                    manager.delete(&name).await;
                }
                if let Some(downstream) = &downstream {
                    downstream
                        .send(name)
                        .unwrap_or_else(|e| error!("Failed to send change event: {}", e));
                }
            }
            debug!("Stopped tracking {} deletions", manager.federated_kind);
        }))
    }

    fn version_name(&self, name: &QualifiedName) -> QualifiedName {
        name.with_name(propagated_version_name(&self.target_kind, &name.name))
    }

    async fn list(&self, cancelation: &CancellationToken) -> Option<Vec<DynamicObject>> {
        let ar = self.adapter.api_resource();
        loop {
            if cancelation.is_cancelled() {
                debug!("Halting version manager list for {}", self.federated_kind);
                return None;
            }
            match self.client.list(&ar, self.namespace.as_deref()).await {
                Ok(records) => return Some(records),
                Err(err) => error!(
                    "Failed to list propagated versions for {}: {err}",
                    self.federated_kind
                ),
            }
            tokio::select! {
                _ = cancelation.cancelled() => {
                    debug!("Halting version manager list for {}", self.federated_kind);
                    return None;
                }
                _ = tokio::time::sleep(LIST_RETRY_DELAY) => {}
            }
        }
    }

    async fn load(&self, records: Vec<DynamicObject>) {
        let prefix = propagated_version_prefix(&self.target_kind);
        let mut cache = self.cache.write().await;
        for record in records {
            let name = record.get_qualified_name();
            // Records of other target kinds share the namespace.
            if name.name.starts_with(&prefix) {
                cache.versions.insert(name, record);
            }
        }
        cache.has_synced = true;
        info!(
            "Version manager for {} synced with {} records",
            self.federated_kind,
            cache.versions.len()
        );
    }

    /// Persists `record` with create or status update, refreshing the
    /// resource version on conflicts. Returns the resource version of the
    /// written object.
    async fn write_version(
        &self,
        record: &DynamicObject,
        name: &QualifiedName,
    ) -> Result<Option<String>> {
        let ar = &self.adapter.api_resource();
        let type_name = self.adapter.type_name();
        let client = &self.client;
        let state = &Mutex::new(WriteState {
            resource_version: record.get_resource_version(),
            refresh: false,
        });
        let attempts = &metrics::counter!(
            VERSION_WRITE_ATTEMPT_TOTAL,
            LABEL_RECORD_TYPE => type_name,
            LABEL_TARGET_KIND => self.target_kind.clone()
        );

        let result = poll_until(WRITE_POLL_INTERVAL, WRITE_TIMEOUT, move || async move {
            let (mut resource_version, refresh) = read_state(state)?;

            if refresh {
                resource_version = match client.get(ar, name).await {
                    Ok(current) => current.and_then(|object| object.get_resource_version()),
                    Err(err) => {
                        error!("Failed to refresh the resourceVersion for {type_name} {name}: {err}");
                        return Ok(Poll::Retry);
                    }
                };
                write_state(state, resource_version.clone(), false)?;
            }

            if resource_version.is_none() {
                let mut created = record.clone();
                created.set_resource_version(None);
                debug!("Creating {type_name} {name}");
                attempts.increment(1);
                match client.create(ar, &created).await {
                    Ok(created) => {
                        resource_version = created.get_resource_version();
                        write_state(state, resource_version.clone(), false)?;
                    }
                    Err(err) if err.is_already_exists() => {
                        debug!("{type_name} {name} was created by another process");
                        write_state(state, None, true)?;
                        return Ok(Poll::Retry);
                    }
                    Err(err) => return retry_unless_forbidden(err, type_name, name),
                }
            }

            let mut updated = record.clone();
            updated.set_resource_version(resource_version);
            debug!("Updating the status of {type_name} {name}");
            attempts.increment(1);
            match client.update_status(ar, &updated).await {
                Ok(written) => Ok(Poll::Done(written.get_resource_version())),
                Err(err) if err.is_conflict() => {
                    debug!("{type_name} {name} was updated by another process");
                    write_state(state, updated.get_resource_version(), true)?;
                    Ok(Poll::Retry)
                }
                Err(err) if err.is_not_found() => {
                    debug!("{type_name} {name} was deleted by another process");
                    write_state(state, None, false)?;
                    Ok(Poll::Retry)
                }
                Err(err) => retry_unless_forbidden(err, type_name, name),
            }
        })
        .await;

        if result.is_err() {
            metrics::counter!(
                VERSION_WRITE_FAILURE_TOTAL,
                LABEL_RECORD_TYPE => type_name,
                LABEL_TARGET_KIND => self.target_kind.clone()
            )
            .increment(1);
        }
        result.with_context(|| format!("Failed to write the version map for {type_name} {name} to the API"))
    }
}

// Forbidden usually means the containing namespace is being deleted.
fn retry_unless_forbidden<T>(
    err: ClientError,
    type_name: &str,
    name: &QualifiedName,
) -> Result<Poll<T>> {
    if err.is_forbidden() {
        return Err(err.into());
    }
    error!("Failed to write {type_name} {name}: {err}");
    Ok(Poll::Retry)
}

fn read_state(state: &Mutex<WriteState>) -> Result<(Option<String>, bool)> {
    let state = state
        .lock()
        .map_err(|_| anyhow!("version write state poisoned"))?;
    Ok((state.resource_version.clone(), state.refresh))
}

fn write_state(
    state: &Mutex<WriteState>,
    resource_version: Option<String>,
    refresh: bool,
) -> Result<()> {
    let mut state = state
        .lock()
        .map_err(|_| anyhow!("version write state poisoned"))?;
    state.resource_version = resource_version;
    state.refresh = refresh;
    Ok(())
}

/// Merges `new_versions` over `old_versions`. Old versions are only kept for
/// selected clusters that have no new version.
fn update_cluster_versions(
    old_versions: &[ClusterObjectVersion],
    mut new_versions: BTreeMap<String, String>,
    selected_clusters: &[String],
) -> Vec<ClusterObjectVersion> {
    let selected: BTreeSet<&str> = selected_clusters.iter().map(String::as_str).collect();
    for old in old_versions {
        if selected.contains(old.cluster_name.as_str()) {
            new_versions
                .entry(old.cluster_name.to_owned())
                .or_insert_with(|| old.version.to_owned());
        }
    }
    version_map_to_cluster_versions(&new_versions)
}
