//! Runs one job through the pipeline: process, archive, classify, report.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::archive::LogArchiver;
use crate::classify::{Outcome, OutcomeClassifier};
use crate::job::{JobIdentity, JobStatus};
use crate::runner::ProcessRunner;
use crate::status::StatusReporter;

pub struct JobExecutor {
    runner: ProcessRunner,
    classifier: OutcomeClassifier,
    archiver: Arc<LogArchiver>,
    reporter: StatusReporter,
    /// Archive tasks that may still be running.
    archives: Mutex<Vec<JoinHandle<()>>>,
}

impl JobExecutor {
    pub fn new(
        runner: ProcessRunner,
        classifier: OutcomeClassifier,
        archiver: LogArchiver,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            runner,
            classifier,
            archiver: Arc::new(archiver),
            reporter,
            archives: Mutex::new(Vec::new()),
        }
    }

    /// Execute a single attempt of the job and decide its outcome.
    ///
    /// The log archive is started in the background and does not delay the
    /// returned outcome. On failure the status is reported before returning.
    pub async fn execute(&self, identity: &JobIdentity) -> Outcome {
        let result = self.runner.run(identity).await;

        let log = result.combined_log();
        debug!("{}", log);
        self.spawn_archive(identity.clone(), log);

        let outcome = self.classifier.classify(&result);
        match outcome {
            Outcome::Success => info!("Successfully processed {}", identity),
            Outcome::Failure(ref reason) => {
                warn!("Failed to process {}: {}", identity, reason);
                self.reporter.report(identity, &JobStatus::Failed).await;
            }
        }
        outcome
    }

    fn spawn_archive(&self, identity: JobIdentity, log: String) {
        let archiver = Arc::clone(&self.archiver);
        let handle = tokio::spawn(async move {
            // Failures are logged by the archiver; nothing to propagate.
            let _ = archiver.archive(&identity, &log).await;
        });

        let mut archives = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
        archives.retain(|h| !h.is_finished());
        archives.push(handle);
    }

    /// Number of archive tasks not yet finished.
    pub fn pending_archives(&self) -> usize {
        self.archives
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every archive task started so far.
    pub async fn flush_archives(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self.archives.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Log archive task failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::archive::{ArchiveError, LogUploader};
    use crate::classify::FailureReason;
    use crate::command::CommandSpec;
    use crate::runner::ExitError;
    use crate::status::{StatusReportError, StatusSink};

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<(String, String)>>,
        uploads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatusSink for Recorder {
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
    impl LogUploader for Recorder {
        async fn upload(
            &self,
            _identity: &JobIdentity,
            local_dir: &Path,
            _namespace: &str,
        ) -> Result<(), ArchiveError> {
            let log = std::fs::read_to_string(local_dir.join("log.txt")).unwrap();
            self.uploads.lock().unwrap().push(log);
            Ok(())
        }
    }

    fn executor(script: &str, logs: &Path, recorder: &Arc<Recorder>) -> JobExecutor {
        JobExecutor::new(
            ProcessRunner::new(CommandSpec::new("sh", ["-c", script, "process"])),
            OutcomeClassifier::default(),
            LogArchiver::new(logs, recorder.clone()),
            StatusReporter::new(recorder.clone()),
        )
    }

    fn id(raw: &str) -> JobIdentity {
        JobIdentity::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_success_reports_no_status() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let exec = executor("echo processed \"$1\"", dir.path(), &recorder);

        let outcome = exec.execute(&id("seismo.png")).await;
        exec.flush_archives().await;

        assert_eq!(outcome, Outcome::Success);
        assert!(recorder.statuses.lock().unwrap().is_empty());
        assert_eq!(
            recorder.uploads.lock().unwrap().as_slice(),
            &["== stdout ==\nprocessed seismo.png\n\n== stderr ==\n".to_string()]
        );
        assert!(!dir.path().join("seismo.png").exists());
    }

    #[tokio::test]
    async fn test_exit_failure_reports_failed_status() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let exec = executor("exit 1", dir.path(), &recorder);

        let outcome = exec.execute(&id("seismo.png")).await;

        assert_eq!(
            outcome,
            Outcome::Failure(FailureReason::ProcessError(ExitError::Status(1)))
        );
        assert_eq!(
            recorder.statuses.lock().unwrap().as_slice(),
            &[("seismo.png".to_string(), "failed".to_string())]
        );
        exec.flush_archives().await;
        assert_eq!(recorder.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_masked_failure_is_detected() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let exec = executor(
            "echo 'Traceback (most recent call last):' >&2; exit 0",
            dir.path(),
            &recorder,
        );

        let outcome = exec.execute(&id("seismo.png")).await;

        assert!(matches!(
            outcome,
            Outcome::Failure(FailureReason::DetectedFault { .. })
        ));
        assert_eq!(recorder.statuses.lock().unwrap().len(), 1);
        exec.flush_archives().await;
        assert!(recorder.uploads.lock().unwrap()[0].contains("Traceback"));
    }

    #[tokio::test]
    async fn test_flush_waits_for_all_archives() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let exec = executor("true", dir.path(), &recorder);

        for name in ["a.png", "b.png", "c.png"] {
            exec.execute(&id(name)).await;
        }
        exec.flush_archives().await;

        assert_eq!(exec.pending_archives(), 0);
        assert_eq!(recorder.uploads.lock().unwrap().len(), 3);
    }
}
