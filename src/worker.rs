//! Queue worker: takes deliveries, runs them through the executor, settles them.
//!
//! The worker owns the queue subscription for its whole lifetime. A shutdown
//! request stops it from taking new deliveries, but every job already handed
//! out runs to completion and is resolved or rejected before `run` returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::classify::Outcome;
use crate::executor::JobExecutor;
use crate::job::JobPayload;
use crate::work_queue::{Delivery, JobQueue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next delivery.
    Subscribed,
    /// At least one job is running.
    Processing,
    /// Shutdown requested; in-flight jobs are finishing.
    Draining,
    Stopped,
}

/// Counts of how deliveries were settled over a worker's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub resolved: usize,
    pub rejected: usize,
    /// Deliveries whose ack/reject could not be sent to the queue.
    pub settle_errors: usize,
}

impl WorkerSummary {
    pub fn total(&self) -> usize {
        self.resolved + self.rejected + self.settle_errors
    }

    fn record(&mut self, settled: Settled) {
        match settled {
            Settled::Resolved => self.resolved += 1,
            Settled::Rejected => self.rejected += 1,
            Settled::Error => self.settle_errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settled {
    Resolved,
    Rejected,
    Error,
}

/// Publishes the worker state and tracks how many jobs are running.
///
/// The active count is only touched inside `send_if_modified`, which holds the
/// channel's write lock, so the count and the published state never disagree.
struct StateTracker {
    state: watch::Sender<WorkerState>,
    active: AtomicUsize,
}

impl StateTracker {
    fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Subscribed);
        Self {
            state,
            active: AtomicUsize::new(0),
        }
    }

    fn job_started(&self) {
        self.state.send_if_modified(|state| {
            self.active.fetch_add(1, Ordering::SeqCst);
            if *state == WorkerState::Subscribed {
                *state = WorkerState::Processing;
                true
            } else {
                false
            }
        });
    }

    fn job_finished(&self) {
        self.state.send_if_modified(|state| {
            let was_last = self.active.fetch_sub(1, Ordering::SeqCst) == 1;
            if was_last && *state == WorkerState::Processing {
                *state = WorkerState::Subscribed;
                true
            } else {
                false
            }
        });
    }

    fn set(&self, next: WorkerState) {
        self.state.send_replace(next);
    }
}

pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    executor: Arc<JobExecutor>,
    concurrency: usize,
    tracker: Arc<StateTracker>,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn JobQueue>, executor: impl Into<Arc<JobExecutor>>) -> Self {
        Self {
            queue,
            executor: executor.into(),
            concurrency: 1,
            tracker: Arc::new(StateTracker::new()),
        }
    }

    /// Number of jobs allowed to run at once. Values below 1 are raised to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.tracker.state.subscribe()
    }

    /// Process deliveries until `shutdown` flips to `true` or the queue ends
    /// the subscription, then drain.
    ///
    /// Draining waits for every in-flight job to be settled, tears down the
    /// subscription and waits for pending log archives. A queue error while
    /// waiting for deliveries is returned after the drain completes.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerSummary, QueueError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Settled> = JoinSet::new();
        let mut summary = WorkerSummary::default();
        let mut failure = None;

        info!(
            "Worker subscribed (concurrency {}), waiting for jobs",
            self.concurrency
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                summary.record(settled_or_error(joined));
            }

            if *shutdown.borrow_and_update() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                next = self.queue.next_delivery() => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        info!("Queue subscription ended");
                        break;
                    }
                    Err(e) => {
                        error!("Error receiving from queue: {}", e);
                        failure = Some(e);
                        break;
                    }
                },
            };

            self.tracker.job_started();
            let executor = Arc::clone(&self.executor);
            let tracker = Arc::clone(&self.tracker);
            tasks.spawn(async move {
                let settled = handle_delivery(&executor, delivery).await;
                tracker.job_finished();
                drop(permit);
                settled
            });
        }

        self.tracker.set(WorkerState::Draining);
        if !tasks.is_empty() {
            info!("Waiting for {} in-flight job(s) to finish", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            summary.record(settled_or_error(joined));
        }

        if let Err(e) = self.queue.shutdown().await {
            warn!("Error shutting down queue subscription: {}", e);
        }
        self.executor.flush_archives().await;
        self.tracker.set(WorkerState::Stopped);

        info!(
            "Worker stopped: {} resolved, {} rejected, {} settle errors",
            summary.resolved, summary.rejected, summary.settle_errors
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Resolves once shutdown has been requested. Never resolves if the sender
/// is dropped without requesting it.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

fn settled_or_error(joined: Result<Settled, tokio::task::JoinError>) -> Settled {
    joined.unwrap_or_else(|e| {
        error!("Job task failed: {}", e);
        Settled::Error
    })
}

async fn handle_delivery(executor: &JobExecutor, mut delivery: Delivery) -> Settled {
    let label = delivery.label().to_string();

    let parsed = JobPayload::from_slice(delivery.payload())
        .and_then(|payload| payload.identity().map_err(Into::into));
    let identity = match parsed {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejecting delivery {}: invalid payload: {}", label, e);
            return settle(&label, delivery.reject(&e.to_string()).await, Settled::Rejected);
        }
    };

    info!("Received job {} (delivery {})", identity, label);
    if let Err(e) = delivery.progress(0).await {
        debug!("Could not report progress for {}: {}", label, e);
    }

    match executor.execute(&identity).await {
        Outcome::Success => settle(&label, delivery.resolve().await, Settled::Resolved),
        Outcome::Failure(reason) => settle(
            &label,
            delivery.reject(&reason.to_string()).await,
            Settled::Rejected,
        ),
    }
}

fn settle(label: &str, result: Result<(), QueueError>, on_success: Settled) -> Settled {
    match result {
        Ok(()) => on_success,
        Err(e) => {
            error!("Failed to settle delivery {}: {}", label, e);
            Settled::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::archive::{ArchiveError, LogArchiver, LogUploader};
    use crate::classify::OutcomeClassifier;
    use crate::command::CommandSpec;
    use crate::job::JobIdentity;
    use crate::runner::ProcessRunner;
    use crate::status::{CommandStatusSink, StatusReporter};
    use crate::work_queue::{MemoryQueue, Settlement};

    struct NoUpload;

    #[async_trait]
    impl LogUploader for NoUpload {
        async fn upload(
            &self,
            _identity: &JobIdentity,
            _local_dir: &Path,
            _namespace: &str,
        ) -> Result<(), ArchiveError> {
            Ok(())
        }
    }

    fn executor(script: &str, logs: &Path) -> JobExecutor {
        JobExecutor::new(
            ProcessRunner::new(CommandSpec::new("sh", ["-c", script, "process"])),
            OutcomeClassifier::default(),
            LogArchiver::new(logs, Arc::new(NoUpload)),
            StatusReporter::new(Arc::new(CommandStatusSink::new(CommandSpec::new(
                "true",
                Vec::<String>::new(),
            )))),
        )
    }

    #[test]
    fn test_concurrency_floor() {
        let dir = tempdir().unwrap();
        let worker = QueueWorker::new(Arc::new(MemoryQueue::new()), executor("true", dir.path()))
            .with_concurrency(0);
        assert_eq!(worker.concurrency(), 1);
    }

    #[tokio::test]
    async fn test_invalid_payloads_rejected_without_running() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!("touch {}", marker.display());

        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(b"not json".to_vec()).unwrap();
        queue.enqueue_job(&JobPayload::new("../etc")).unwrap();
        queue.enqueue_job(&JobPayload::new("-rf")).unwrap();
        queue.enqueue_job(&JobPayload::new("a b.png")).unwrap();
        queue.close();

        let (_stop, shutdown) = watch::channel(false);
        let summary = QueueWorker::new(queue.clone(), executor(&script, dir.path()))
            .run(shutdown)
            .await
            .unwrap();

        assert_eq!(summary.rejected, 4);
        assert_eq!(summary.resolved, 0);
        assert!(!marker.exists());
        assert!(queue
            .completions()
            .iter()
            .all(|c| matches!(c.settlement, Settlement::Rejected(_))));
        assert!(queue.progress_reports().is_empty());
    }

    #[tokio::test]
    async fn test_state_ends_stopped() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue_job(&JobPayload::new("a.png")).unwrap();
        queue.close();

        let worker = QueueWorker::new(queue.clone(), executor("true", dir.path()));
        let state = worker.state();
        assert_eq!(*state.borrow(), WorkerState::Subscribed);

        let (_stop, shutdown) = watch::channel(false);
        let summary = worker.run(shutdown).await.unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(queue.progress_reports(), vec![("mem-1".to_string(), 0)]);
    }
}
