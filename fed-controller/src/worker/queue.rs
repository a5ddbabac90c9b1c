use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::error;

/// FIFO of keys to reconcile.
///
/// A key is queued at most once. A key added while it is being processed is
/// queued again once [`WorkQueue::done`] is called for it, so a key is never
/// processed by two workers at the same time.
pub struct WorkQueue<K> {
    tx: loole::Sender<K>,
    rx: loole::Receiver<K>,
    state: Mutex<QueueState<K>>,
}

struct QueueState<K> {
    dirty: HashSet<K>,
    processing: HashSet<K>,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        WorkQueue::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> WorkQueue<K> {
        let (tx, rx) = loole::unbounded();
        WorkQueue {
            tx,
            rx,
            state: Mutex::new(QueueState {
                dirty: HashSet::new(),
                processing: HashSet::new(),
            }),
        }
    }

    pub fn add(&self, key: K) {
        let Ok(mut state) = self.state.lock() else {
            error!("Work queue state poisoned");
            return;
        };
        if !state.dirty.insert(key.clone()) || state.processing.contains(&key) {
            return;
        }
        drop(state);
        self.send(key);
    }

    /// Waits for the next key. `None` once `cancelation` fires.
    pub async fn get(&self, cancelation: &CancellationToken) -> Option<K> {
        let key = tokio::select! {
            _ = cancelation.cancelled() => return None,
            key = self.rx.recv_async() => key.ok()?,
        };
        let mut state = self.state.lock().ok()?;
        state.dirty.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Marks `key` as processed, queueing it again if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let Ok(mut state) = self.state.lock() else {
            error!("Work queue state poisoned");
            return;
        };
        state.processing.remove(key);
        if state.dirty.contains(key) {
            drop(state);
            self.send(key.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn send(&self, key: K) {
        self.tx
            .send(key)
            .unwrap_or_else(|e| error!("Work queue send error: {e}"));
    }
}
