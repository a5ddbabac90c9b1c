use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use fedkube::kube::cache::{CacheReader, ObjectCache};
use fedkube::kube::types::QualifiedName;
use kube::api::{DynamicObject, GroupVersionKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::membership::{ClusterLifecycleHandler, MemberClusters};

/// Read access to target objects across member clusters.
pub trait TargetStore: Send + Sync {
    /// The target object `key` in `cluster`. `Ok(None)` when the object, or
    /// the cluster's cache, does not exist.
    fn get_by_key(&self, cluster: &str, key: &QualifiedName) -> Result<Option<Arc<DynamicObject>>>;
    /// True when the caches of all `clusters` have completed their initial
    /// listing.
    fn clusters_synced(&self, clusters: &[String]) -> bool;
}

/// Keeps one cache of the target type per ready member cluster.
///
/// Caches are started when a cluster becomes available and stopped when it
/// becomes unavailable. Every change seen by any cache is published on the
/// change channel.
pub struct FederatedInformer {
    clusters: Arc<MemberClusters>,
    target: GroupVersionKind,
    namespace: Option<String>,
    caches: Arc<DashMap<String, ObjectCache>>,
    tx: loole::Sender<QualifiedName>,
    cancelation: CancellationToken,
}

impl FederatedInformer {
    pub fn new(
        clusters: Arc<MemberClusters>,
        target: GroupVersionKind,
        namespace: Option<String>,
        tx: loole::Sender<QualifiedName>,
        cancelation: CancellationToken,
    ) -> FederatedInformer {
        FederatedInformer {
            clusters,
            target,
            namespace,
            caches: Arc::new(DashMap::new()),
            tx,
            cancelation,
        }
    }

    pub fn stop(&self) {
        self.cancelation.cancel();
        self.caches.clear();
    }

    fn start_cache(&self, cluster: &str) {
        let client = match self.clusters.client(cluster) {
            Ok(client) => client,
            Err(err) => {
                error!("Cannot watch {} in {cluster}: {err}", self.target.kind);
                return;
            }
        };
        let cluster = cluster.to_owned();
        let states = self.clusters.states();
        let target = self.target.clone();
        let namespace = self.namespace.clone();
        let caches = self.caches.clone();
        let tx = self.tx.clone();
        let cancelation = self.cancelation.child_token();

        tokio::spawn(async move {
            let ar = match client.resolve(&target).await {
                Ok(ar) => ar,
                Err(err) => {
                    error!("Cannot resolve {} in {cluster}: {err}", target.kind);
                    return;
                }
            };
            // The cluster may have gone away while discovery was running.
            if !states.state(&cluster).is_some_and(|s| s.is_ready()) {
                debug!("{cluster} is no longer ready, not starting {} cache", target.kind);
                return;
            }
            let cache = ObjectCache::start(client, ar, namespace, tx, cancelation);
            info!("Started {} cache for {cluster}", target.kind);
            if let Some(previous) = caches.insert(cluster, cache) {
                previous.stop();
            }
        });
    }
}

impl ClusterLifecycleHandler for FederatedInformer {
    fn cluster_available(&self, cluster: &str) {
        self.start_cache(cluster);
    }

    fn cluster_unavailable(&self, cluster: &str) {
        if let Some((_, cache)) = self.caches.remove(cluster) {
            info!("Stopping {} cache for {cluster}", self.target.kind);
            cache.stop();
        }
    }
}

impl TargetStore for FederatedInformer {
    fn get_by_key(&self, cluster: &str, key: &QualifiedName) -> Result<Option<Arc<DynamicObject>>> {
        Ok(self
            .caches
            .get(cluster)
            .and_then(|cache| cache.value().get(key)))
    }

    fn clusters_synced(&self, clusters: &[String]) -> bool {
        clusters.iter().all(|cluster| {
            self.caches
                .get(cluster)
                .is_some_and(|cache| cache.value().has_synced())
        })
    }
}
