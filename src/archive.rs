//! Log archival: stage locally, upload, clean up.
//!
//! Each job's combined output is written to `<logs_root>/<identity>/log.txt`,
//! handed to the uploader under the `logs` namespace, and the staging
//! directory is removed afterwards whether or not the upload worked.
//! Archives of the same identity run one at a time so a redelivered job never
//! shares its staging directory with a previous run still being uploaded.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::CommandSpec;
use crate::job::JobIdentity;

/// File name of the staged log inside a job's staging directory.
pub const LOG_FILENAME: &str = "log.txt";

/// Remote namespace logs are uploaded under.
pub const LOG_NAMESPACE: &str = "logs";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to write log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch log upload: {0}")]
    UploadLaunch(#[source] io::Error),

    #[error("log upload failed ({status}): {stderr}")]
    Upload { status: String, stderr: String },

    #[error("failed to remove staging directory {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Remote storage for staged logs.
#[async_trait]
pub trait LogUploader: Send + Sync {
    /// Copy the contents of `local_dir` to remote storage under
    /// `<namespace>/<identity>/`.
    async fn upload(
        &self,
        identity: &JobIdentity,
        local_dir: &Path,
        namespace: &str,
    ) -> Result<(), ArchiveError>;
}

/// Uploads by running a command with `identity local_dir namespace` appended.
#[derive(Debug, Clone)]
pub struct CommandUploader {
    command: CommandSpec,
}

impl CommandUploader {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl LogUploader for CommandUploader {
    async fn upload(
        &self,
        identity: &JobIdentity,
        local_dir: &Path,
        namespace: &str,
    ) -> Result<(), ArchiveError> {
        let dir = local_dir.to_string_lossy().into_owned();
        debug!(
            "{}",
            self.command
                .display_with(&[identity.as_str(), dir.as_str(), namespace])
        );

        let output = self
            .command
            .build([identity.as_str(), dir.as_str(), namespace])
            .output()
            .await
            .map_err(ArchiveError::UploadLaunch)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ArchiveError::Upload {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

pub struct LogArchiver {
    logs_root: PathBuf,
    uploader: Arc<dyn LogUploader>,
    /// One lock per identity with an archive in progress.
    in_progress: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LogArchiver {
    pub fn new(logs_root: impl Into<PathBuf>, uploader: Arc<dyn LogUploader>) -> Self {
        Self {
            logs_root: logs_root.into(),
            uploader,
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    /// Staging directory for a job's log.
    pub fn staging_dir(&self, identity: &JobIdentity) -> PathBuf {
        self.logs_root.join(identity.as_str())
    }

    /// Stage, upload, and remove a job's log.
    ///
    /// Returns the first failure, if any. The staging directory is gone when
    /// this returns, unless removing it was itself the failure.
    pub async fn archive(&self, identity: &JobIdentity, text: &str) -> Result<(), ArchiveError> {
        let slot = self.acquire_slot(identity);
        let result = {
            let _guard = slot.lock().await;
            self.archive_exclusive(identity, text).await
        };
        drop(slot);
        self.release_slot(identity);
        result
    }

    fn acquire_slot(&self, identity: &JobIdentity) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(identity.as_str().to_string()).or_default())
    }

    /// Forget the identity's lock once nobody holds or waits on it.
    fn release_slot(&self, identity: &JobIdentity) {
        let mut slots = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(identity.as_str())
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(identity.as_str());
        }
    }

    async fn archive_exclusive(
        &self,
        identity: &JobIdentity,
        text: &str,
    ) -> Result<(), ArchiveError> {
        let dir = self.staging_dir(identity);

        let mut first_error = match self.stage(&dir, text).await {
            Ok(()) => self
                .uploader
                .upload(identity, &dir, LOG_NAMESPACE)
                .await
                .err(),
            Err(e) => Some(e),
        };
        if let Some(ref e) = first_error {
            warn!("Error archiving log for {}: {}", identity, e);
        }

        if let Err(e) = remove_dir_all_if_exists(&dir).await {
            let e = ArchiveError::Cleanup {
                path: dir.clone(),
                source: e,
            };
            warn!("{}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Archived log for {}", identity);
                Ok(())
            }
        }
    }

    async fn stage(&self, dir: &Path, text: &str) -> Result<(), ArchiveError> {
        let path = dir.join(LOG_FILENAME);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ArchiveError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|source| ArchiveError::Write { path, source })
    }
}

async fn remove_dir_all_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
