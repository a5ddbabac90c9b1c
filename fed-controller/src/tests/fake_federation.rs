use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use dashmap::DashMap;
use fedkube::kube::dynamic_object_ext::DynamicObjectExt;
use fedkube::kube::types::QualifiedName;
use kube::api::DynamicObject;

use crate::federation::informer::TargetStore;
use crate::federation::membership::ClusterMembership;

pub struct FakeMembership {
    ready: Mutex<Vec<String>>,
    synced: AtomicBool,
    failing: AtomicBool,
}

impl FakeMembership {
    pub fn with_ready(clusters: &[&str]) -> Arc<FakeMembership> {
        Arc::new(FakeMembership {
            ready: Mutex::new(clusters.iter().map(|c| c.to_string()).collect()),
            synced: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ClusterMembership for FakeMembership {
    fn ready_clusters(&self) -> Result<Vec<String>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("cluster list unavailable");
        }
        Ok(self.ready.lock().unwrap().clone())
    }

    fn clusters_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeTargetStore {
    objects: DashMap<(String, QualifiedName), Arc<DynamicObject>>,
    failing: Mutex<HashSet<String>>,
    unsynced: Mutex<HashSet<String>>,
}

impl FakeTargetStore {
    pub fn new() -> Arc<FakeTargetStore> {
        Arc::new(FakeTargetStore::default())
    }

    pub fn put(&self, cluster: &str, object: DynamicObject) {
        self.objects.insert(
            (cluster.to_string(), object.get_qualified_name()),
            Arc::new(object),
        );
    }

    /// Lookups in `cluster` fail until cleared.
    pub fn fail_cluster(&self, cluster: &str) {
        self.failing.lock().unwrap().insert(cluster.to_string());
    }

    pub fn set_unsynced(&self, cluster: &str) {
        self.unsynced.lock().unwrap().insert(cluster.to_string());
    }
}

impl TargetStore for FakeTargetStore {
    fn get_by_key(&self, cluster: &str, key: &QualifiedName) -> Result<Option<Arc<DynamicObject>>> {
        if self.failing.lock().unwrap().contains(cluster) {
            bail!("cache of {cluster} unavailable");
        }
        Ok(self
            .objects
            .get(&(cluster.to_string(), key.clone()))
            .map(|entry| entry.value().clone()))
    }

    fn clusters_synced(&self, clusters: &[String]) -> bool {
        let unsynced = self.unsynced.lock().unwrap();
        clusters.iter().all(|cluster| !unsynced.contains(cluster))
    }
}
