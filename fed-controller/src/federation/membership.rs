use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use fedkube::client::KubeClient;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info};

/// Snapshot of member clusters that can currently be reconciled against.
pub trait ClusterMembership: Send + Sync {
    /// Names of ready clusters, sorted.
    fn ready_clusters(&self) -> Result<Vec<String>>;
    /// True once the health of every configured cluster has been probed.
    fn clusters_synced(&self) -> bool;
}

/// Notified when a member cluster becomes ready or stops being ready.
pub trait ClusterLifecycleHandler: Send + Sync {
    fn cluster_available(&self, cluster: &str);
    fn cluster_unavailable(&self, cluster: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    Unavailable,
    Ready { since: Instant },
    NotReady { since: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    Healthy { now: Instant },
    Unhealthy { now: Instant },
}

impl ClusterState {
    fn on_event(&self, event: ClusterEvent) -> Option<ClusterState> {
        match (event, self) {
            (
                ClusterEvent::Healthy { now },
                ClusterState::Unavailable | ClusterState::NotReady { .. },
            ) => Some(ClusterState::Ready { since: now }),
            (ClusterEvent::Healthy { .. }, ClusterState::Ready { .. }) => None,
            (ClusterEvent::Unhealthy { now }, ClusterState::Ready { .. }) => {
                Some(ClusterState::NotReady { since: now })
            }
            (
                ClusterEvent::Unhealthy { .. },
                ClusterState::Unavailable | ClusterState::NotReady { .. },
            ) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ClusterState::Ready { .. })
    }
}

/// Health state of every configured member cluster, and the handlers to
/// notify about transitions. Handlers are called in registration order.
#[derive(Default)]
pub struct ClusterStates {
    states: DashMap<String, ClusterState>,
    synced: AtomicBool,
    handlers: RwLock<Vec<Arc<dyn ClusterLifecycleHandler>>>,
}

impl ClusterStates {
    pub fn new<I, S>(names: I) -> ClusterStates
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states = ClusterStates::default();
        for name in names {
            states.states.insert(name.into(), ClusterState::Unavailable);
        }
        states
    }

    pub fn add_handler(&self, handler: Arc<dyn ClusterLifecycleHandler>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(_) => error!("Cluster handler list poisoned"),
        }
    }

    pub fn state(&self, cluster: &str) -> Option<ClusterState> {
        self.states.get(cluster).map(|s| *s.value())
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Applies a probe result and notifies handlers if the cluster changed
    /// between ready and not ready.
    pub fn on_event(&self, cluster: &str, event: ClusterEvent) {
        let new_state = {
            let Some(mut state) = self.states.get_mut(cluster) else {
                debug!("Ignoring event for unknown cluster {cluster}");
                return;
            };
            let new_state = state.on_event(event);
            if let Some(new_state) = new_state {
                *state = new_state;
            }
            new_state
        };

        let Some(new_state) = new_state else {
            return;
        };
        info!("Cluster {cluster} is now {new_state:?}");
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => {
                error!("Cluster handler list poisoned");
                return;
            }
        };
        for handler in handlers {
            if new_state.is_ready() {
                handler.cluster_available(cluster);
            } else {
                handler.cluster_unavailable(cluster);
            }
        }
    }
}

impl ClusterMembership for ClusterStates {
    fn ready_clusters(&self) -> Result<Vec<String>> {
        let mut ready: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.value().is_ready())
            .map(|entry| entry.key().to_owned())
            .collect();
        ready.sort();
        Ok(ready)
    }

    fn clusters_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Member clusters with their API clients, probed periodically.
pub struct MemberClusters {
    clients: BTreeMap<String, KubeClient>,
    states: Arc<ClusterStates>,
}

impl MemberClusters {
    pub fn new(clients: BTreeMap<String, KubeClient>) -> MemberClusters {
        let states = Arc::new(ClusterStates::new(clients.keys().cloned()));
        MemberClusters { clients, states }
    }

    pub fn client(&self, cluster: &str) -> Result<KubeClient> {
        self.clients
            .get(cluster)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown member cluster {cluster}"))
    }

    pub fn states(&self) -> Arc<ClusterStates> {
        self.states.clone()
    }

    /// Probes every cluster each `period` until cancelled.
    pub fn start(
        self: &Arc<Self>,
        period: Duration,
        cancelation: CancellationToken,
    ) -> AbortOnDropHandle<()> {
        let clusters = self.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancelation.cancelled() => {
                        debug!("Cluster health checks stopped");
                        return;
                    }
                    _ = interval.tick() => clusters.probe().await,
                }
            }
        }))
    }

    async fn probe(&self) {
        for (name, client) in &self.clients {
            let now = Instant::now();
            let event = if client.is_healthy().await {
                ClusterEvent::Healthy { now }
            } else {
                ClusterEvent::Unhealthy { now }
            };
            self.states.on_event(name, event);
        }
        self.states.mark_synced();
    }
}
