pub mod pinner;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::Cid;
use common::blocks::BlockStoreError;
use common::retry::{RetryDecision, RetryTracker, calculate_backoff};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PinConfig;
use crate::repo::RepoError;

pub use pinner::{ContentFetcher, FetchedBlock, Pinner};

#[derive(Debug, Error)]
pub enum PinError {
    /// Network fetch failed; transient, retried with bounded attempts.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Data did not validate against its CID; terminal.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("block store error: {0}")]
    Store(#[from] BlockStoreError),

    #[error("repository error: {0}")]
    Db(#[from] RepoError),
}

impl PinError {
    pub fn retryable(&self) -> bool {
        matches!(self, PinError::Fetch(_))
    }
}

/// A "make this content durable locally" job.
#[derive(Debug, Clone)]
pub struct PinJob {
    pub content_id: i64,
    pub owner: i64,
    pub cid: Cid,
}

/// Executes the actual pin work: fetch, validate, store, record objects.
#[async_trait]
pub trait PinWorker: Send + Sync {
    /// Returns the total verified size in bytes on success.
    async fn execute(&self, job: &PinJob) -> Result<i64, PinError>;
}

/// Receives terminal pin outcomes and applies the content state
/// transition.
#[async_trait]
pub trait PinStatusSink: Send + Sync {
    async fn pin_succeeded(&self, job: &PinJob, size: i64);
    async fn pin_failed(&self, job: &PinJob, error: &PinError);
}

struct SchedState {
    queue: VecDeque<PinJob>,
    /// Content ids queued, backing off, or running. One entry per id at
    /// all times, which is what makes `submit` idempotent.
    tracked: HashSet<i64>,
    running_per_owner: HashMap<i64, usize>,
}

/// Bounded-concurrency pin worker pool with per-owner fairness.
///
/// A fixed pool of workers drains a FIFO queue; jobs whose owner is at the
/// per-owner ceiling stay queued and are released in submission order as
/// slots free up.
pub struct PinScheduler {
    state: Mutex<SchedState>,
    notify: Notify,
    worker: Arc<dyn PinWorker>,
    sink: Arc<dyn PinStatusSink>,
    retries: Mutex<RetryTracker>,
    cfg: PinConfig,
    shutdown: CancellationToken,
}

impl PinScheduler {
    pub fn new(
        cfg: PinConfig,
        worker: Arc<dyn PinWorker>,
        sink: Arc<dyn PinStatusSink>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState {
                queue: VecDeque::new(),
                tracked: HashSet::new(),
                running_per_owner: HashMap::new(),
            }),
            notify: Notify::new(),
            worker,
            sink,
            retries: Mutex::new(RetryTracker::new(cfg.max_retries)),
            cfg,
            shutdown,
        })
    }

    /// Enqueue a pin job. Re-submitting a content id that is already
    /// queued or running is a no-op; returns whether the job was accepted.
    pub fn submit(&self, job: PinJob) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.tracked.insert(job.content_id) {
                return false;
            }
            state.queue.push_back(job);
        }
        self.notify.notify_one();
        true
    }

    /// Spawn the worker pool. Workers exit at the next idle point after
    /// the shutdown token fires; in-flight jobs run to completion.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(workers = self.cfg.workers, "Starting pin scheduler");
        (0..self.cfg.workers)
            .map(|_| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_worker().await })
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                self.take_runnable(&mut state)
            };

            match job {
                Some(job) => self.run_job(job).await,
                None => {
                    if self.shutdown.is_cancelled() {
                        return;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Pop the first queued job whose owner is below the concurrency
    /// ceiling, leaving later jobs in order.
    fn take_runnable(&self, state: &mut SchedState) -> Option<PinJob> {
        let idx = state.queue.iter().position(|j| {
            state
                .running_per_owner
                .get(&j.owner)
                .copied()
                .unwrap_or(0)
                < self.cfg.max_active_per_owner
        })?;
        let job = state.queue.remove(idx)?;
        *state.running_per_owner.entry(job.owner).or_insert(0) += 1;
        Some(job)
    }

    /// Free the owner slot; forget the content id unless it stays tracked
    /// for a pending retry.
    fn release(&self, job: &PinJob, keep_tracked: bool) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = state.running_per_owner.get_mut(&job.owner) {
                *count -= 1;
                if *count == 0 {
                    state.running_per_owner.remove(&job.owner);
                }
            }
            if !keep_tracked {
                state.tracked.remove(&job.content_id);
            }
        }
        self.notify.notify_one();
    }

    fn requeue(&self, job: PinJob) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.queue.push_back(job);
        }
        self.notify.notify_one();
    }

    async fn run_job(self: &Arc<Self>, job: PinJob) {
        match self.worker.execute(&job).await {
            Ok(size) => {
                self.retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear(job.content_id);
                self.sink.pin_succeeded(&job, size).await;
                self.release(&job, false);
            }
            Err(e) if e.retryable() => {
                let decision = self
                    .retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_failure(job.content_id, &e.to_string());

                match decision {
                    RetryDecision::Retry { attempt, .. } => {
                        let delay = calculate_backoff(
                            attempt,
                            self.cfg.backoff_base_ms,
                            self.cfg.backoff_max_ms,
                        );
                        warn!(
                            content_id = job.content_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying pin job"
                        );
                        // Keep the id tracked during backoff so duplicate
                        // submits remain no-ops.
                        self.release(&job, true);
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = this.shutdown.cancelled() => {
                                    // Forget the job; a pin queue refresh
                                    // after restart picks it back up.
                                    this.forget(job.content_id);
                                }
                                _ = tokio::time::sleep(delay) => this.requeue(job),
                            }
                        });
                    }
                    RetryDecision::Exhausted { history } => {
                        warn!(
                            content_id = job.content_id,
                            attempts = history.len(),
                            error = %e,
                            "Pin retries exhausted"
                        );
                        self.sink.pin_failed(&job, &e).await;
                        self.release(&job, false);
                    }
                }
            }
            Err(e) => {
                self.retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear(job.content_id);
                self.sink.pin_failed(&job, &e).await;
                self.release(&job, false);
            }
        }
    }

    fn forget(&self, content_id: i64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tracked.remove(&content_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;

    fn test_cfg(workers: usize, per_owner: usize, max_retries: u8) -> PinConfig {
        PinConfig {
            workers,
            max_active_per_owner: per_owner,
            max_retries,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
        }
    }

    fn job(id: i64, owner: i64) -> PinJob {
        PinJob {
            content_id: id,
            owner,
            cid: Cid::compute(&id.to_le_bytes()),
        }
    }

    /// Worker that parks jobs on a semaphore until the test releases them.
    struct GatedWorker {
        gate: Semaphore,
        executions: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedWorker {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                executions: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PinWorker for GatedWorker {
        async fn execute(&self, _job: &PinJob) -> Result<i64, PinError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let permit = self.gate.acquire().await.map_err(|_| {
                PinError::Fetch("gate closed".into())
            })?;
            permit.forget();

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    /// Worker that fails a fixed number of times before succeeding.
    struct FlakyWorker {
        failures_left: Mutex<u8>,
        executions: AtomicUsize,
    }

    #[async_trait]
    impl PinWorker for FlakyWorker {
        async fn execute(&self, _job: &PinJob) -> Result<i64, PinError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                Err(PinError::Fetch("timeout".into()))
            } else {
                Ok(42)
            }
        }
    }

    struct ValidationFailWorker;

    #[async_trait]
    impl PinWorker for ValidationFailWorker {
        async fn execute(&self, _job: &PinJob) -> Result<i64, PinError> {
            Err(PinError::Validation("bad block".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        succeeded: Mutex<Vec<(i64, i64)>>,
        failed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl PinStatusSink for RecordingSink {
        async fn pin_succeeded(&self, job: &PinJob, size: i64) {
            self.succeeded.lock().unwrap().push((job.content_id, size));
        }

        async fn pin_failed(&self, job: &PinJob, _error: &PinError) {
            self.failed.lock().unwrap().push(job.content_id);
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn duplicate_submit_is_noop() {
        let worker = Arc::new(GatedWorker::new());
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let sched = PinScheduler::new(
            test_cfg(4, 20, 0),
            worker.clone(),
            sink.clone(),
            shutdown.clone(),
        );
        sched.spawn_workers();

        assert!(sched.submit(job(1, 1)));
        assert!(!sched.submit(job(1, 1)));

        wait_until(|| worker.executions.load(Ordering::SeqCst) == 1).await;
        // Still running; resubmission must remain a no-op.
        assert!(!sched.submit(job(1, 1)));

        worker.gate.add_permits(1);
        wait_until(|| sink.succeeded.lock().unwrap().len() == 1).await;
        assert_eq!(worker.executions.load(Ordering::SeqCst), 1);

        // Once finished, the id may be pinned again.
        assert!(sched.submit(job(1, 1)));
        worker.gate.add_permits(1);
        wait_until(|| sink.succeeded.lock().unwrap().len() == 2).await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn per_owner_ceiling_is_enforced() {
        let worker = Arc::new(GatedWorker::new());
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let sched = PinScheduler::new(
            test_cfg(8, 2, 0),
            worker.clone(),
            sink.clone(),
            shutdown.clone(),
        );
        sched.spawn_workers();

        for i in 1..=5 {
            assert!(sched.submit(job(i, 7)));
        }

        wait_until(|| worker.active.load(Ordering::SeqCst) == 2).await;
        // Give the pool a chance to (incorrectly) start more.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.active.load(Ordering::SeqCst), 2);

        worker.gate.add_permits(5);
        wait_until(|| sink.succeeded.lock().unwrap().len() == 5).await;
        assert!(worker.max_active.load(Ordering::SeqCst) <= 2);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn owners_do_not_starve_each_other() {
        let worker = Arc::new(GatedWorker::new());
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let sched = PinScheduler::new(
            test_cfg(8, 1, 0),
            worker.clone(),
            sink.clone(),
            shutdown.clone(),
        );
        sched.spawn_workers();

        // Owner 1 saturates its ceiling; owner 2's job must still run.
        sched.submit(job(1, 1));
        sched.submit(job(2, 1));
        sched.submit(job(3, 2));

        wait_until(|| worker.active.load(Ordering::SeqCst) == 2).await;

        worker.gate.add_permits(3);
        wait_until(|| sink.succeeded.lock().unwrap().len() == 3).await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn transient_failure_is_retried_to_success() {
        let worker = Arc::new(FlakyWorker {
            failures_left: Mutex::new(2),
            executions: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let sched = PinScheduler::new(
            test_cfg(2, 20, 3),
            worker.clone(),
            sink.clone(),
            shutdown.clone(),
        );
        sched.spawn_workers();

        sched.submit(job(9, 1));

        wait_until(|| sink.succeeded.lock().unwrap().len() == 1).await;
        assert_eq!(worker.executions.load(Ordering::SeqCst), 3);
        assert_eq!(sink.succeeded.lock().unwrap()[0], (9, 42));
        assert!(sink.failed.lock().unwrap().is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let worker = Arc::new(FlakyWorker {
            failures_left: Mutex::new(10),
            executions: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let sched = PinScheduler::new(
            test_cfg(2, 20, 2),
            worker.clone(),
            sink.clone(),
            shutdown.clone(),
        );
        sched.spawn_workers();

        sched.submit(job(4, 1));

        wait_until(|| sink.failed.lock().unwrap().len() == 1).await;
        // Initial attempt plus max_retries re-runs.
        assert_eq!(worker.executions.load(Ordering::SeqCst), 3);

        // Terminal: the id is free again.
        assert!(sched.submit(job(4, 1)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn validation_failure_is_not_retried() {
        let sink = Arc::new(RecordingSink::default());
        let shutdown = CancellationToken::new();
        let sched = PinScheduler::new(
            test_cfg(2, 20, 5),
            Arc::new(ValidationFailWorker),
            sink.clone(),
            shutdown.clone(),
        );
        sched.spawn_workers();

        sched.submit(job(5, 1));

        wait_until(|| sink.failed.lock().unwrap().len() == 1).await;
        assert!(sink.succeeded.lock().unwrap().is_empty());

        shutdown.cancel();
    }
}
