use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error};

/// Hands keys to a handler once their delivery time has come.
///
/// A key is pending at most once. Scheduling an already pending key keeps
/// the earlier of the two delivery times.
pub struct DelayingDeliverer<K> {
    state: Mutex<PendingItems<K>>,
    notify: Notify,
}

struct PendingItems<K> {
    deadlines: HashMap<K, Instant>,
    ordered: BTreeSet<(Instant, K)>,
}

impl<K> PendingItems<K>
where
    K: Clone + Eq + Hash + Ord,
{
    fn schedule(&mut self, key: K, at: Instant) -> bool {
        if let Some(existing) = self.deadlines.get(&key) {
            if *existing <= at {
                return false;
            }
            self.ordered.remove(&(*existing, key.clone()));
        }
        self.ordered.insert((at, key.clone()));
        self.deadlines.insert(key, at);
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.ordered.first().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = vec![];
        while self.ordered.first().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, key)) = self.ordered.pop_first() {
                self.deadlines.remove(&key);
                due.push(key);
            }
        }
        due
    }
}

impl<K> Default for DelayingDeliverer<K>
where
    K: Clone + Eq + Hash + Ord + Send + Sync + 'static,
{
    fn default() -> Self {
        DelayingDeliverer::new()
    }
}

impl<K> DelayingDeliverer<K>
where
    K: Clone + Eq + Hash + Ord + Send + Sync + 'static,
{
    pub fn new() -> DelayingDeliverer<K> {
        DelayingDeliverer {
            state: Mutex::new(PendingItems {
                deadlines: HashMap::new(),
                ordered: BTreeSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn deliver_now(&self, key: K) {
        self.deliver_at(key, Instant::now());
    }

    pub fn deliver_after(&self, key: K, delay: Duration) {
        self.deliver_at(key, Instant::now() + delay);
    }

    pub fn deliver_at(&self, key: K, at: Instant) {
        let scheduled = match self.state.lock() {
            Ok(mut state) => state.schedule(key, at),
            Err(_) => {
                error!("Deliverer state poisoned");
                false
            }
        };
        if scheduled {
            self.notify.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.deadlines.len()).unwrap_or(0)
    }

    /// Spawns the delivery loop. It stops when `cancelation` fires or the
    /// returned handle is dropped.
    pub fn start<H>(self: &Arc<Self>, handler: H, cancelation: CancellationToken) -> AbortOnDropHandle<()>
    where
        H: Fn(K) + Send + Sync + 'static,
    {
        let deliverer = self.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            deliverer.run(handler, cancelation).await;
        }))
    }

    async fn run<H>(&self, handler: H, cancelation: CancellationToken)
    where
        H: Fn(K) + Send + Sync + 'static,
    {
        loop {
            let next = match self.state.lock() {
                Ok(state) => state.next_deadline(),
                Err(_) => {
                    error!("Deliverer state poisoned, stopping");
                    return;
                }
            };
            let sleep = async {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancelation.cancelled() => {
                    debug!("Deliverer stopped");
                    return;
                }
                _ = self.notify.notified() => continue,
                _ = sleep => {}
            }

            let due = match self.state.lock() {
                Ok(mut state) => state.pop_due(Instant::now()),
                Err(_) => vec![],
            };
            for key in due {
                handler(key);
            }
        }
    }
}
