use super::dynamic_object_ext::DynamicObjectExt;
use super::types::QualifiedName;
use crate::JoinErrToStr;
use crate::client::KubeClient;
use anyhow::{Result, bail};
use dashmap::DashMap;
use futures::FutureExt;
use futures::StreamExt;
use futures::TryFutureExt;
use futures::future::MapErr;
use futures::future::Shared;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::watcher::Event;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, trace};

const STREAM_RECONNECT_DELAY_MS: u64 = 1000;

/// Read access to an informer-style object cache.
pub trait CacheReader: Send + Sync {
    fn get(&self, name: &QualifiedName) -> Option<Arc<DynamicObject>>;
    fn keys(&self) -> Vec<QualifiedName>;
    /// True once the initial listing has been fully loaded.
    fn has_synced(&self) -> bool;
}

/// Watch-backed cache of all objects of one kind, in one cluster.
///
/// Every applied or deleted object's name is published on the change channel.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<ObjectCacheInner>,
    #[allow(dead_code)]
    handle: Shared<MapErr<AbortOnDropHandle<()>, JoinErrToStr>>,
}

struct ObjectCacheInner {
    client: KubeClient,
    ar: ApiResource,
    namespace: Option<String>,
    objects: DashMap<QualifiedName, Arc<DynamicObject>>,
    synced: AtomicBool,
    tx: loole::Sender<QualifiedName>,
    cancelation: CancellationToken,
}

impl ObjectCache {
    pub fn start(
        client: KubeClient,
        ar: ApiResource,
        namespace: Option<String>,
        tx: loole::Sender<QualifiedName>,
        cancelation: CancellationToken,
    ) -> ObjectCache {
        let inner = Arc::new(ObjectCacheInner {
            client,
            ar,
            namespace,
            objects: DashMap::new(),
            synced: AtomicBool::new(false),
            tx,
            cancelation,
        });

        let handle = tokio::spawn({
            let inner = inner.clone();
            async move {
                while !inner.cancelation.is_cancelled() {
                    if let Err(error) = inner.run_inner().await {
                        error!("Retrying {} watch: {error}", inner.ar.kind);
                        tokio::time::sleep(Duration::from_millis(STREAM_RECONNECT_DELAY_MS)).await;
                    } else {
                        info!("{} watch stopped.", inner.ar.kind);
                        break;
                    }
                }
            }
        });

        let handle = AbortOnDropHandle::new(handle)
            .map_err(Box::new(|e: JoinError| e.to_string()) as JoinErrToStr)
            .shared();

        ObjectCache { inner, handle }
    }

    pub fn stop(&self) {
        self.inner.cancelation.cancel();
    }
}

impl CacheReader for ObjectCache {
    fn get(&self, name: &QualifiedName) -> Option<Arc<DynamicObject>> {
        self.inner.objects.get(name).map(|e| e.value().clone())
    }

    fn keys(&self) -> Vec<QualifiedName> {
        self.inner.objects.iter().map(|e| e.key().clone()).collect()
    }

    fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }
}

impl ObjectCacheInner {
    async fn run_inner(&self) -> Result<()> {
        let mut events = self
            .client
            .event_stream_for(&self.ar, self.namespace.as_deref())
            .boxed();
        let mut initial: Option<BTreeMap<QualifiedName, Arc<DynamicObject>>> = None;
        loop {
            tokio::select! {
                _ = self.cancelation.cancelled() => break,
                event = events.next() => {
                    trace!("event received {:?}", event);
                    match event {
                        Some(Ok(event)) => self.handle_event(event, &mut initial),
                        Some(Err(e)) => bail!("Error in event stream {}", e),
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_event(
        &self,
        event: Event<DynamicObject>,
        initial: &mut Option<BTreeMap<QualifiedName, Arc<DynamicObject>>>,
    ) {
        match event {
            Event::Init => *initial = Some(BTreeMap::new()),
            Event::InitApply(obj) => {
                let name = obj.get_qualified_name();
                initial
                    .get_or_insert_default()
                    .insert(name, Arc::new(obj));
            }
            Event::InitDone => {
                let loaded = initial.take().unwrap_or_default();
                self.replace_all(loaded);
                self.synced.store(true, Ordering::Release);
                debug!("{} cache synced", self.ar.kind);
            }
            Event::Apply(obj) => {
                let name = obj.get_qualified_name();
                self.objects.insert(name.clone(), Arc::new(obj));
                self.notify(name);
            }
            Event::Delete(obj) => {
                let name = obj.get_qualified_name();
                self.objects.remove(&name);
                self.notify(name);
            }
        }
    }

    /// Swaps in a fresh listing; names that disappeared or changed are
    /// published.
    fn replace_all(&self, loaded: BTreeMap<QualifiedName, Arc<DynamicObject>>) {
        let removed: Vec<QualifiedName> = self
            .objects
            .iter()
            .filter(|e| !loaded.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for name in removed {
            self.objects.remove(&name);
            self.notify(name);
        }
        for (name, obj) in loaded {
            let changed = self
                .objects
                .get(&name)
                .map(|existing| existing.metadata.resource_version != obj.metadata.resource_version)
                .unwrap_or(true);
            self.objects.insert(name.clone(), obj);
            if changed {
                self.notify(name);
            }
        }
    }

    fn notify(&self, name: QualifiedName) {
        self.tx
            .send(name)
            .unwrap_or_else(|e| error!("Failed to send change event: {}", e));
    }
}
