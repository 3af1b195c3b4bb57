//! Terminal status reporting to the external status system.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::CommandSpec;
use crate::job::{JobIdentity, JobStatus};

#[derive(Debug, Error)]
pub enum StatusReportError {
    #[error("failed to launch status command: {0}")]
    Launch(#[source] io::Error),

    #[error("status command failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
}

/// External system that records job status by identity.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_status(
        &self,
        identity: &JobIdentity,
        status: &JobStatus,
    ) -> Result<(), StatusReportError>;
}

/// Records status by running a command with `identity status` appended.
#[derive(Debug, Clone)]
pub struct CommandStatusSink {
    command: CommandSpec,
}

impl CommandStatusSink {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl StatusSink for CommandStatusSink {
    async fn set_status(
        &self,
        identity: &JobIdentity,
        status: &JobStatus,
    ) -> Result<(), StatusReportError> {
        debug!(
            "{}",
            self.command
                .display_with(&[identity.as_str(), status.as_str()])
        );

        let output = self
            .command
            .build([identity.as_str(), status.as_str()])
            .output()
            .await
            .map_err(StatusReportError::Launch)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(StatusReportError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Reports terminal status, absorbing failures.
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    /// Record `status` for `identity`. Errors are logged, never returned.
    pub async fn report(&self, identity: &JobIdentity, status: &JobStatus) {
        if let Err(e) = self.sink.set_status(identity, status).await {
            warn!("Error setting status of {} to {}: {}", identity, status, e);
        }
    }
}
