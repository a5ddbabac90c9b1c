use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fedkube::kube::types::QualifiedName;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info, info_span};

use super::deliverer::DelayingDeliverer;
use super::queue::WorkQueue;
use crate::metrics::{LABEL_CONTROLLER, LABEL_OUTCOME, RECONCILE_DURATION_SECONDS, RECONCILE_TOTAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationStatus {
    AllOk,
    /// Try again after the retry delay.
    NeedsRecheck,
    /// Try again with exponential backoff.
    Error,
    /// Caches are not ready, try again after the cluster sync delay.
    NotSynced,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::AllOk => "AllOk",
            ReconciliationStatus::NeedsRecheck => "NeedsRecheck",
            ReconciliationStatus::Error => "Error",
            ReconciliationStatus::NotSynced => "NotSynced",
        }
    }
}

impl Display for ReconciliationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &QualifiedName) -> ReconciliationStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTiming {
    pub retry_delay: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub cluster_sync_delay: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            cluster_sync_delay: Duration::from_secs(20),
        }
    }
}

/// Runs a [`Reconciler`] for queued keys on a bounded number of tasks,
/// rescheduling each key according to the outcome of its reconcile.
pub struct ReconcileWorker {
    name: String,
    queue: Arc<WorkQueue<QualifiedName>>,
    deliverer: Arc<DelayingDeliverer<QualifiedName>>,
    backoff: DashMap<QualifiedName, Duration>,
    timing: WorkerTiming,
    max_concurrent_reconciles: usize,
}

impl ReconcileWorker {
    pub fn new(
        name: impl Into<String>,
        timing: WorkerTiming,
        max_concurrent_reconciles: usize,
    ) -> ReconcileWorker {
        ReconcileWorker {
            name: name.into(),
            queue: Arc::new(WorkQueue::new()),
            deliverer: Arc::new(DelayingDeliverer::new()),
            backoff: DashMap::new(),
            timing,
            max_concurrent_reconciles: max_concurrent_reconciles.max(1),
        }
    }

    pub fn enqueue(&self, key: QualifiedName) {
        self.deliverer.deliver_now(key);
    }

    pub fn enqueue_for_retry(&self, key: QualifiedName) {
        self.deliverer.deliver_after(key, self.timing.retry_delay);
    }

    pub fn enqueue_for_cluster_sync(&self, key: QualifiedName) {
        self.deliverer
            .deliver_after(key, self.timing.cluster_sync_delay);
    }

    pub fn enqueue_with_delay(&self, key: QualifiedName, delay: Duration) {
        self.deliverer.deliver_after(key, delay);
    }

    pub fn enqueue_with_backoff(&self, key: QualifiedName) {
        let delay = self.next_backoff(&key);
        self.deliverer.deliver_after(key, delay);
    }

    /// Starts delivery into the queue and the reconcile tasks. Everything
    /// stops on cancelation or when the returned handles are dropped.
    pub fn run(
        self: &Arc<Self>,
        reconciler: Arc<dyn Reconciler>,
        cancelation: CancellationToken,
    ) -> Vec<AbortOnDropHandle<()>> {
        info!(
            "Starting {} worker with {} reconcilers",
            self.name, self.max_concurrent_reconciles
        );
        let queue = self.queue.clone();
        let mut handles = vec![
            self.deliverer
                .start(move |key| queue.add(key), cancelation.clone()),
        ];
        for _ in 0..self.max_concurrent_reconciles {
            let worker = self.clone();
            let reconciler = reconciler.clone();
            let cancelation = cancelation.clone();
            handles.push(AbortOnDropHandle::new(tokio::spawn(async move {
                while let Some(key) = worker.queue.get(&cancelation).await {
                    worker.reconcile_once(reconciler.as_ref(), key).await;
                }
                debug!("{} reconciler stopped", worker.name);
            })));
        }
        handles
    }

    async fn reconcile_once(&self, reconciler: &dyn Reconciler, key: QualifiedName) {
        let span = info_span!("reconcile", worker = %self.name, key = %key);
        let started = Instant::now();
        let status = reconciler.reconcile(&key).instrument(span).await;
        let elapsed = started.elapsed();
        self.queue.done(&key);
        debug!(
            "{} reconcile of {key} finished: {status} (duration: {elapsed:?})",
            self.name
        );

        metrics::histogram!(RECONCILE_DURATION_SECONDS, LABEL_CONTROLLER => self.name.clone())
            .record(elapsed.as_secs_f64());
        metrics::counter!(
            RECONCILE_TOTAL,
            LABEL_CONTROLLER => self.name.clone(),
            LABEL_OUTCOME => status.as_str()
        )
        .increment(1);

        match status {
            ReconciliationStatus::AllOk => {
                self.backoff.remove(&key);
            }
            ReconciliationStatus::Error => self.enqueue_with_backoff(key),
            ReconciliationStatus::NeedsRecheck => self.enqueue_for_retry(key),
            ReconciliationStatus::NotSynced => self.enqueue_for_cluster_sync(key),
        }
    }

    fn next_backoff(&self, key: &QualifiedName) -> Duration {
        let mut entry = self
            .backoff
            .entry(key.clone())
            .or_insert(Duration::ZERO);
        let next = if entry.is_zero() {
            self.timing.initial_backoff
        } else {
            (*entry * 2).min(self.timing.max_backoff)
        };
        *entry = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::recorded_metrics::RecordedMetrics;
    use metrics_util::debugging::DebuggingRecorder;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted outcomes and records when each reconcile happened.
    struct ScriptedReconciler {
        outcomes: Mutex<VecDeque<ReconciliationStatus>>,
        calls: Mutex<Vec<(QualifiedName, Instant)>>,
        delay: Duration,
    }

    impl ScriptedReconciler {
        fn new(outcomes: &[ReconciliationStatus]) -> Arc<ScriptedReconciler> {
            Arc::new(ScriptedReconciler {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: Mutex::new(vec![]),
                delay: Duration::ZERO,
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait]
    impl Reconciler for ScriptedReconciler {
        async fn reconcile(&self, key: &QualifiedName) -> ReconciliationStatus {
            self.calls.lock().unwrap().push((key.clone(), Instant::now()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ReconciliationStatus::AllOk)
        }
    }

    fn key(name: &str) -> QualifiedName {
        QualifiedName::new("default", name)
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_drive_rescheduling() {
        use ReconciliationStatus::*;
        let worker = Arc::new(ReconcileWorker::new("test", WorkerTiming::default(), 1));
        let reconciler = ScriptedReconciler::new(&[NeedsRecheck, NotSynced, Error, Error, AllOk]);
        let _handles = worker.run(reconciler.clone(), CancellationToken::new());
        let start = Instant::now();

        worker.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(120)).await;

        let offsets: Vec<u64> = reconciler
            .call_times()
            .iter()
            .map(|at| (*at - start).as_secs())
            .collect();
        // now, +10 retry, +20 cluster sync, +5 backoff, +10 doubled backoff
        assert_eq!(offsets, vec![0, 10, 30, 35, 45]);
        assert!(worker.backoff.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let worker = ReconcileWorker::new("test", WorkerTiming::default(), 1);
        let delays: Vec<u64> = (0..6)
            .map(|_| worker.next_backoff(&key("a")).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(worker.next_backoff(&key("b")).as_secs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_is_never_reconciled_concurrently() {
        let worker = Arc::new(ReconcileWorker::new("test", WorkerTiming::default(), 4));
        let reconciler = Arc::new(ScriptedReconciler {
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(vec![]),
            delay: Duration::from_secs(1),
        });
        let _handles = worker.run(reconciler.clone(), CancellationToken::new());
        let start = Instant::now();

        worker.enqueue(key("a"));
        worker.enqueue(key("b"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let calls = reconciler.calls.lock().unwrap().clone();
        let a_offsets: Vec<u128> = calls
            .iter()
            .filter(|(k, _)| *k == key("a"))
            .map(|(_, at)| (*at - start).as_millis())
            .collect();
        // The second reconcile of "a" waits for the first to finish.
        assert_eq!(a_offsets, vec![0, 1000]);
        assert_eq!(calls.iter().filter(|(k, _)| *k == key("b")).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciles_are_measured_per_outcome() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let worker = Arc::new(ReconcileWorker::new(
            "federateddeploymentstatus",
            WorkerTiming::default(),
            1,
        ));
        let reconciler = Arc::new(ScriptedReconciler {
            outcomes: Mutex::new(VecDeque::from([ReconciliationStatus::NeedsRecheck])),
            calls: Mutex::new(vec![]),
            delay: Duration::from_secs(2),
        });
        let _handles = worker.run(reconciler.clone(), CancellationToken::new());

        worker.enqueue(key("a"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        let recorded = RecordedMetrics::take(&snapshotter);
        let controller = (LABEL_CONTROLLER, "federateddeploymentstatus");
        assert_eq!(
            recorded.counter(RECONCILE_TOTAL, &[controller, (LABEL_OUTCOME, "NeedsRecheck")]),
            1
        );
        assert_eq!(
            recorded.counter(RECONCILE_TOTAL, &[controller, (LABEL_OUTCOME, "AllOk")]),
            1
        );
        assert_eq!(
            recorded.counter(RECONCILE_TOTAL, &[controller, (LABEL_OUTCOME, "Error")]),
            0
        );
        let durations = recorded.histogram(RECONCILE_DURATION_SECONDS, &[controller]);
        assert_eq!(durations.len(), 2);
        assert!(durations.iter().all(|seconds| (2.0..2.1).contains(seconds)));
    }
}
