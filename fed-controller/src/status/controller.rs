use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use fedkube::kube::cache::CacheReader;
use fedkube::kube::dynamic_object_ext::DynamicObjectExt;
use fedkube::kube::store::ObjectStore;
use fedkube::kube::types::QualifiedName;
use fedresource::federatedstatus::{AggregatedStatus, ClusterStatus};
use kube::api::{ApiResource, DynamicObject};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::config::configuration::ControllerConfig;
use crate::federation::informer::TargetStore;
use crate::federation::membership::{ClusterLifecycleHandler, ClusterMembership};
use crate::utils::poll::{Poll, poll_until};
use crate::worker::deliverer::DelayingDeliverer;
use crate::worker::reconcile::{ReconcileWorker, Reconciler, ReconciliationStatus, WorkerTiming};

const ALL_CLUSTERS: &str = "ALL_CLUSTERS";
const SYNCED_POLL_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StatusTiming {
    pub cluster_available_delay: Duration,
    pub cluster_unavailable_delay: Duration,
    pub small_delay: Duration,
    pub cache_sync_timeout: Duration,
    pub worker: WorkerTiming,
}

impl StatusTiming {
    pub fn from_config(config: &ControllerConfig) -> StatusTiming {
        let cluster_available_delay = config.cluster_available_delay();
        let retry_delay = if config.minimize_latency {
            Duration::from_millis(50)
        } else {
            WorkerTiming::default().retry_delay
        };
        StatusTiming {
            cluster_available_delay,
            cluster_unavailable_delay: config.cluster_unavailable_delay(),
            small_delay: config.small_delay(),
            cache_sync_timeout: config.cache_sync_timeout(),
            worker: WorkerTiming {
                retry_delay,
                cluster_sync_delay: cluster_available_delay,
                ..WorkerTiming::default()
            },
        }
    }
}

/// Sources the controller reads from.
pub struct StatusSources {
    pub federated: Arc<dyn CacheReader>,
    pub status: Arc<dyn CacheReader>,
    pub membership: Arc<dyn ClusterMembership>,
    pub targets: Arc<dyn TargetStore>,
}

/// Collects the status of a federated resource's target objects in every
/// ready member cluster and persists it as a status object owned by the
/// federated resource.
pub struct StatusController {
    federated_kind: String,
    status_ar: ApiResource,
    sources: StatusSources,
    client: Arc<dyn ObjectStore>,
    worker: Arc<ReconcileWorker>,
    cluster_deliverer: Arc<DelayingDeliverer<String>>,
    timing: StatusTiming,
}

impl StatusController {
    pub fn new(
        federated_kind: impl Into<String>,
        status_ar: ApiResource,
        sources: StatusSources,
        client: Arc<dyn ObjectStore>,
        timing: StatusTiming,
        max_concurrent_reconciles: usize,
    ) -> StatusController {
        let worker = ReconcileWorker::new(
            status_ar.kind.to_lowercase(),
            timing.worker,
            max_concurrent_reconciles,
        );
        StatusController {
            federated_kind: federated_kind.into(),
            status_ar,
            sources,
            client,
            worker: Arc::new(worker),
            cluster_deliverer: Arc::new(DelayingDeliverer::new()),
            timing,
        }
    }

    /// Starts the reconcile worker, the cluster change sweep and the
    /// consumers of the change channels.
    ///
    /// Federated and status object changes are reconciled right away, target
    /// object changes after the retry delay.
    pub fn run(
        self: &Arc<Self>,
        object_changes: loole::Receiver<QualifiedName>,
        target_changes: loole::Receiver<QualifiedName>,
        cancelation: CancellationToken,
    ) -> Vec<AbortOnDropHandle<()>> {
        info!("Starting status controller for {}", self.federated_kind);
        let mut handles = self.worker.run(self.clone(), cancelation.child_token());

        let controller = self.clone();
        handles.push(self.cluster_deliverer.start(
            move |_| controller.reconcile_on_cluster_change(),
            cancelation.child_token(),
        ));

        let worker = self.worker.clone();
        handles.push(forward(object_changes, cancelation.child_token(), move |key| {
            worker.enqueue(key)
        }));
        let worker = self.worker.clone();
        handles.push(forward(target_changes, cancelation.child_token(), move |key| {
            worker.enqueue_for_retry(key)
        }));
        handles
    }

    /// True when the cluster list, the host caches and the target caches of
    /// all ready clusters have synced.
    pub fn is_synced(&self) -> bool {
        if !self.sources.membership.clusters_synced() {
            debug!("Cluster list not synced");
            return false;
        }
        if !self.sources.federated.has_synced() {
            debug!("Federated type not synced");
            return false;
        }
        if !self.sources.status.has_synced() {
            debug!("Status not synced");
            return false;
        }
        let clusters = match self.sources.membership.ready_clusters() {
            Ok(clusters) => clusters,
            Err(err) => {
                error!("Failed to get ready clusters: {err}");
                return false;
            }
        };
        if !self.sources.targets.clusters_synced(&clusters) {
            debug!("Target clusters' informers not synced");
            return false;
        }
        true
    }

    /// Schedules every federated resource for reconcile. Runs again after the
    /// cluster available delay while caches are still syncing.
    pub fn reconcile_on_cluster_change(&self) {
        if !self.is_synced() {
            self.cluster_deliverer
                .deliver_after(ALL_CLUSTERS.into(), self.timing.cluster_available_delay);
        }
        for key in self.sources.federated.keys() {
            self.worker.enqueue_with_delay(key, self.timing.small_delay);
        }
    }

    async fn wait_for_sync(&self) -> Result<()> {
        poll_until(SYNCED_POLL_PERIOD, self.timing.cache_sync_timeout, move || async move {
            Ok(if self.is_synced() {
                Poll::Done(())
            } else {
                Poll::Retry
            })
        })
        .await
    }

    async fn reconcile_status(&self, key: &QualifiedName) -> ReconciliationStatus {
        let status_kind = &self.status_ar.kind;
        if let Err(err) = self.wait_for_sync().await {
            error!("Failed to wait for all data stores to sync: {err}");
            return ReconciliationStatus::NotSynced;
        }

        debug!("Starting to reconcile {status_kind} {key}");

        let federated = match self.sources.federated.get(key) {
            Some(federated) if !federated.is_being_deleted() => federated,
            _ => {
                // The status object is owned by the federated object and is
                // garbage collected with it.
                debug!("No federated type for {} {key} found", self.federated_kind);
                return ReconciliationStatus::AllOk;
            }
        };

        let clusters = match self.sources.membership.ready_clusters() {
            Ok(clusters) => clusters,
            Err(err) => {
                error!("Failed to get cluster list: {err}");
                return ReconciliationStatus::NotSynced;
            }
        };

        let cluster_statuses = match self.cluster_statuses(&clusters, key) {
            Ok(statuses) => statuses,
            Err(err) => {
                error!("{err}");
                return ReconciliationStatus::Error;
            }
        };

        let generation = federated.metadata.generation.unwrap_or_default();
        let status = AggregatedStatus::new(generation, cluster_statuses);

        match self.sources.status.get(key) {
            None => self.create_status(&federated, key, &status).await,
            Some(existing) => self.update_status(&existing, key, &status).await,
        }
    }

    async fn create_status(
        &self,
        federated: &DynamicObject,
        key: &QualifiedName,
        status: &AggregatedStatus,
    ) -> ReconciliationStatus {
        let status_kind = &self.status_ar.kind;
        let object = federated.get_owner_reference().and_then(|owner| {
            status.to_object(
                &self.status_ar,
                key.namespace().map(str::to_owned),
                &key.name,
                owner,
            )
        });
        let object = match object {
            Ok(object) => object,
            Err(err) => {
                error!("Failed to build {status_kind} {key}: {err}");
                return ReconciliationStatus::Error;
            }
        };
        match self.client.create(&self.status_ar, &object).await {
            Ok(_) => ReconciliationStatus::AllOk,
            Err(err) => {
                error!("Failed to create status object for federated type {status_kind} {key}: {err}");
                ReconciliationStatus::NeedsRecheck
            }
        }
    }

    async fn update_status(
        &self,
        existing: &DynamicObject,
        key: &QualifiedName,
        status: &AggregatedStatus,
    ) -> ReconciliationStatus {
        let status_kind = &self.status_ar.kind;
        let clusters = match serde_json::to_value(&status.clusters) {
            Ok(clusters) => clusters,
            Err(err) => {
                error!("Failed to serialize {status_kind} {key}: {err}");
                return ReconciliationStatus::Error;
            }
        };
        if existing.data.get("clusters") == Some(&clusters) {
            debug!("{status_kind} {key} is up to date");
            return ReconciliationStatus::AllOk;
        }

        let mut updated = existing.clone();
        if let Err(err) = status.write_clusters_into(&mut updated) {
            error!("Failed to update {status_kind} {key}: {err}");
            return ReconciliationStatus::Error;
        }
        match self.client.update(&self.status_ar, &updated).await {
            Ok(_) => ReconciliationStatus::AllOk,
            Err(err) => {
                error!("Failed to update status object for federated type {status_kind} {key}: {err}");
                ReconciliationStatus::NeedsRecheck
            }
        }
    }

    /// Status of the target object in each of `clusters`. A missing target,
    /// or one without a readable status, is recorded without status.
    fn cluster_statuses(&self, clusters: &[String], key: &QualifiedName) -> Result<Vec<ClusterStatus>> {
        let mut statuses = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let target = self
                .sources
                .targets
                .get_by_key(cluster, key)
                .map_err(|err| anyhow!("Failed to get {key} from cluster {cluster}: {err}"))?;

            let status = match target {
                Some(target) => match target.get_status_map() {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => {
                        warn!("Target {key} in cluster {cluster} has no status");
                        None
                    }
                    Err(err) => {
                        warn!("Failed to get status of {key} in cluster {cluster}: {err}");
                        None
                    }
                },
                None => None,
            };
            statuses.push(ClusterStatus::new(cluster.as_str(), status));
        }
        Ok(statuses)
    }
}

#[async_trait]
impl Reconciler for StatusController {
    async fn reconcile(&self, key: &QualifiedName) -> ReconciliationStatus {
        self.reconcile_status(key).await
    }
}

impl ClusterLifecycleHandler for StatusController {
    fn cluster_available(&self, cluster: &str) {
        debug!("{cluster} available, reconciling all {}", self.federated_kind);
        self.cluster_deliverer
            .deliver_after(ALL_CLUSTERS.into(), self.timing.cluster_available_delay);
    }

    fn cluster_unavailable(&self, cluster: &str) {
        debug!("{cluster} unavailable, reconciling all {}", self.federated_kind);
        self.cluster_deliverer
            .deliver_after(ALL_CLUSTERS.into(), self.timing.cluster_unavailable_delay);
    }
}

fn forward<F>(
    rx: loole::Receiver<QualifiedName>,
    cancelation: CancellationToken,
    handler: F,
) -> AbortOnDropHandle<()>
where
    F: Fn(QualifiedName) + Send + 'static,
{
    AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancelation.cancelled() => return,
                key = rx.recv_async() => match key {
                    Ok(key) => handler(key),
                    Err(_) => return,
                },
            }
        }
    }))
}
