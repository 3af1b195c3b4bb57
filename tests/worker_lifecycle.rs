//! Worker Lifecycle Tests
//!
//! Drives the full pipeline (queue, worker, executor, archiver, status) with
//! `sh -c` scripts standing in for the external processor.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::watch;

use queue_worker::archive::{ArchiveError, LogArchiver, LogUploader};
use queue_worker::classify::OutcomeClassifier;
use queue_worker::command::CommandSpec;
use queue_worker::executor::JobExecutor;
use queue_worker::job::{JobIdentity, JobPayload, JobStatus};
use queue_worker::runner::ProcessRunner;
use queue_worker::status::{StatusReportError, StatusReporter, StatusSink};
use queue_worker::work_queue::{MemoryQueue, Settlement};
use queue_worker::worker::{QueueWorker, WorkerState, WorkerSummary};

/// Fake remote storage and status system.
#[derive(Default)]
struct Collaborators {
    fail_uploads: bool,
    upload_delay: Duration,
    statuses: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, String)>>,
    /// Staged log contents as seen by each upload, `None` if missing.
    staged_logs: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl StatusSink for Collaborators {
    async fn set_status(
        &self,
        identity: &JobIdentity,
        status: &JobStatus,
    ) -> Result<(), StatusReportError> {
        self.statuses
            .lock()
            .unwrap()
            .push((identity.to_string(), status.to_string()));
        Ok(())
    }
}

#[async_trait]
impl LogUploader for Collaborators {
    async fn upload(
        &self,
        identity: &JobIdentity,
        local_dir: &Path,
        namespace: &str,
    ) -> Result<(), ArchiveError> {
        assert_eq!(namespace, "logs");
        tokio::time::sleep(self.upload_delay).await;
        let staged = std::fs::read_to_string(local_dir.join("log.txt")).ok();
        self.staged_logs.lock().unwrap().push(staged);
        if self.fail_uploads {
            return Err(ArchiveError::Upload {
                status: "exit status: 1".to_string(),
                stderr: "bucket unavailable".to_string(),
            });
        }
        self.uploads
            .lock()
            .unwrap()
            .push((identity.to_string(), namespace.to_string()));
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    logs: PathBuf,
    queue: Arc<MemoryQueue>,
    collaborators: Arc<Collaborators>,
}

impl Harness {
    fn new(fail_uploads: bool) -> Self {
        Self::with_collaborators(Collaborators {
            fail_uploads,
            ..Default::default()
        })
    }

    fn with_collaborators(collaborators: Collaborators) -> Self {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        Self {
            _dir: dir,
            logs,
            queue: Arc::new(MemoryQueue::new()),
            collaborators: Arc::new(collaborators),
        }
    }

    fn enqueue(&self, names: &[&str]) {
        for name in names {
            self.queue.enqueue_job(&JobPayload::new(*name)).unwrap();
        }
    }

    fn worker(&self, script: &str) -> QueueWorker {
        let executor = JobExecutor::new(
            ProcessRunner::new(CommandSpec::new("sh", ["-c", script, "process"])),
            OutcomeClassifier::default(),
            LogArchiver::new(&self.logs, self.collaborators.clone()),
            StatusReporter::new(self.collaborators.clone()),
        );
        QueueWorker::new(self.queue.clone(), executor)
    }

    fn settlements(&self) -> Vec<Settlement> {
        self.queue
            .completions()
            .into_iter()
            .map(|c| c.settlement)
            .collect()
    }

    fn statuses(&self) -> Vec<(String, String)> {
        self.collaborators.statuses.lock().unwrap().clone()
    }
}

/// Run until the queue's backlog is exhausted.
async fn run_to_completion(harness: &Harness, script: &str) -> WorkerSummary {
    harness.queue.close();
    let (_stop, shutdown) = watch::channel(false);
    tokio::time::timeout(Duration::from_secs(10), harness.worker(script).run(shutdown))
        .await
        .expect("worker did not finish")
        .unwrap()
}

#[tokio::test]
async fn test_clean_exit_is_acknowledged_without_status() {
    let harness = Harness::new(false);
    harness.enqueue(&["seismo-1.png"]);

    let summary = run_to_completion(&harness, "echo digitized \"$1\"").await;

    assert_eq!(summary.resolved, 1);
    assert_eq!(harness.settlements(), vec![Settlement::Resolved]);
    assert!(harness.statuses().is_empty());
    assert_eq!(
        harness.collaborators.uploads.lock().unwrap().as_slice(),
        &[("seismo-1.png".to_string(), "logs".to_string())]
    );
    assert!(!harness.logs.join("seismo-1.png").exists());
}

#[tokio::test]
async fn test_nonzero_exit_reports_failed_and_rejects() {
    let harness = Harness::new(false);
    harness.enqueue(&["seismo-1.png"]);

    let summary = run_to_completion(&harness, "echo 'bad header' >&2; exit 1").await;

    assert_eq!(summary.rejected, 1);
    assert_eq!(
        harness.statuses(),
        vec![("seismo-1.png".to_string(), "failed".to_string())]
    );
    match harness.settlements().as_slice() {
        [Settlement::Rejected(reason)] => {
            assert!(reason.contains("exited with status 1"), "{}", reason)
        }
        other => panic!("unexpected settlements: {:?}", other),
    }
}

#[tokio::test]
async fn test_traceback_with_zero_exit_is_rejected() {
    let harness = Harness::new(false);
    harness.enqueue(&["seismo-1.png"]);

    let script = "printf 'Traceback (most recent call last):\\n  ValueError\\n' >&2; exit 0";
    let summary = run_to_completion(&harness, script).await;

    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.resolved, 0);
    assert_eq!(
        harness.statuses(),
        vec![("seismo-1.png".to_string(), "failed".to_string())]
    );
}

#[tokio::test]
async fn test_traceback_on_stdout_is_not_a_fault() {
    let harness = Harness::new(false);
    harness.enqueue(&["seismo-1.png"]);

    let summary = run_to_completion(&harness, "echo 'Traceback is a word'").await;

    assert_eq!(summary.resolved, 1);
    assert!(harness.statuses().is_empty());
}

#[tokio::test]
async fn test_upload_failure_does_not_change_outcome() {
    let harness = Harness::new(true);
    harness.enqueue(&["ok.png", "bad.png"]);

    let summary = run_to_completion(&harness, "test \"$1\" = ok.png").await;

    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.rejected, 1);
    assert!(!harness.logs.join("ok.png").exists());
    assert!(!harness.logs.join("bad.png").exists());
}

#[tokio::test]
async fn test_redelivered_identity_keeps_both_logs() {
    let harness = Harness::with_collaborators(Collaborators {
        upload_delay: Duration::from_millis(300),
        ..Default::default()
    });
    harness.enqueue(&["a.png", "a.png"]);

    let summary = run_to_completion(&harness, "echo run").await;

    assert_eq!(summary.resolved, 2);
    let staged = harness.collaborators.staged_logs.lock().unwrap().clone();
    assert_eq!(staged.len(), 2);
    assert!(
        staged.iter().all(|log| log.as_deref().is_some_and(|l| l.contains("run"))),
        "{:?}",
        staged
    );
    assert!(!harness.logs.join("a.png").exists());
}

#[tokio::test]
async fn test_every_delivery_settled_exactly_once() {
    let harness = Harness::new(false);
    let names: Vec<String> = (0..12).map(|i| format!("scan-{}.png", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    harness.enqueue(&refs);
    harness.queue.enqueue(b"{\"filename\": \"../escape\"}".to_vec()).unwrap();

    // Odd-numbered scans fail.
    let script = "case \"$1\" in *[13579].png) exit 3;; esac";
    let summary = run_to_completion(&harness, script).await;

    let completions = harness.queue.completions();
    assert_eq!(completions.len(), 13);
    let labels: HashSet<_> = completions.iter().map(|c| c.label.clone()).collect();
    assert_eq!(labels.len(), 13);

    assert_eq!(summary.resolved, 6);
    assert_eq!(summary.rejected, 7);
    assert_eq!(summary.settle_errors, 0);
    // The unsafe identity never reached the processor or status system.
    assert_eq!(harness.statuses().len(), 6);
}

#[tokio::test]
async fn test_shutdown_lets_inflight_job_finish_and_takes_no_more() {
    let harness = Harness::new(false);
    harness.enqueue(&["first.png", "second.png"]);

    let worker = harness.worker("sleep 0.5");
    let mut state = worker.state();
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(worker.run(shutdown));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Processing),
    )
    .await
    .unwrap()
    .unwrap();
    stop.send(true).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.resolved, 1);
    assert_eq!(harness.settlements(), vec![Settlement::Resolved]);
    assert_eq!(harness.queue.completions()[0].label, "mem-1");
    assert_eq!(harness.queue.pending(), 1);
    assert_eq!(*state.borrow(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_while_idle_stops_promptly() {
    let harness = Harness::new(false);
    let worker = harness.worker("true");
    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(worker.run(shutdown));

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.send(true).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.total(), 0);
}

#[tokio::test]
async fn test_pool_runs_jobs_concurrently() {
    let harness = Harness::new(false);
    let markers = tempdir().unwrap();
    harness.enqueue(&["left.png", "right.png"]);

    // Each job waits until both have started, so it only succeeds if they overlap.
    let script = format!(
        "touch '{dir}'/\"$1\"; i=0; while [ $(ls '{dir}' | wc -l) -lt 2 ]; do \
         i=$((i+1)); [ $i -gt 100 ] && exit 1; sleep 0.05; done",
        dir = markers.path().display()
    );

    harness.queue.close();
    let (_stop, shutdown) = watch::channel(false);
    let summary = tokio::time::timeout(
        Duration::from_secs(15),
        harness.worker(&script).with_concurrency(2).run(shutdown),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.resolved, 2);
}
