//! Runs the external processing executable for a job.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::command::CommandSpec;
use crate::job::JobIdentity;

/// Why the executable did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExitError {
    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("exited with status {0}")]
    Status(i32),

    #[error("terminated by signal {0}")]
    Signal(i32),

    #[error("terminated abnormally")]
    Abnormal,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Captured result of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub exit_error: Option<ExitError>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    /// stdout and stderr as one log document with section headers.
    pub fn combined_log(&self) -> String {
        format!(
            "== stdout ==\n{}\n== stderr ==\n{}",
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

/// Spawns the processor with the job identity as its final argument.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: CommandSpec,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            timeout: None,
        }
    }

    /// Kill the executable if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run to completion and capture all output.
    ///
    /// Content of the output is not inspected here; a zero exit always yields
    /// `exit_error: None`. On timeout the processor's whole process group is
    /// killed and whatever output it produced so far is kept.
    pub async fn run(&self, identity: &JobIdentity) -> ExecutionResult {
        info!("{}", self.command.display_with(&[identity.as_str()]));

        let mut cmd = self.command.build([identity.as_str()]);
        cmd.kill_on_drop(true);
        // Own process group: a timeout reaches the processor's children, and a
        // terminal Ctrl+C does not interrupt a job the worker is draining.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult {
                    exit_error: Some(ExitError::Launch {
                        program: self.command.command.clone(),
                        message: e.to_string(),
                    }),
                    ..Default::default()
                }
            }
        };

        // Taken now: once `wait` reaps the leader, `id()` is gone but the group
        // may still have members.
        let group = child.id();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let finished = {
            let completion = async {
                let (_, _, status) = tokio::join!(
                    read_pipe(stdout_pipe.as_mut(), &mut stdout),
                    read_pipe(stderr_pipe.as_mut(), &mut stderr),
                    child.wait(),
                );
                status
            };
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, completion)
                    .await
                    .map_err(|_| limit),
                None => Ok(completion.await),
            }
        };

        let exit_error = match finished {
            Ok(Ok(status)) => {
                debug!(
                    job = %identity,
                    status = ?status,
                    stdout_bytes = stdout.len(),
                    stderr_bytes = stderr.len(),
                    "Processor exited"
                );
                exit_error(status)
            }
            Ok(Err(e)) => {
                warn!("Error waiting for processor on {}: {}", identity, e);
                Some(ExitError::Abnormal)
            }
            Err(limit) => {
                warn!("Processor for {} timed out after {:?}", identity, limit);
                kill_process_group(group);
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill processor for {}: {}", identity, e);
                }
                Some(ExitError::TimedOut(limit))
            }
        };

        ExecutionResult {
            exit_error,
            stdout,
            stderr,
        }
    }
}

/// Read a pipe to EOF. Bytes read before the future is dropped stay in `buf`.
async fn read_pipe<R>(pipe: Option<&mut R>, buf: &mut Vec<u8>)
where
    R: AsyncRead + Unpin,
{
    if let Some(pipe) = pipe {
        if let Err(e) = pipe.read_to_end(buf).await {
            debug!("Error reading processor output: {}", e);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(group: Option<u32>) {
    let Some(pgid) = group.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg takes no pointers. The group id equals the child's pid
    // because the child was spawned with process_group(0).
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(
            "Failed to kill process group {}: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: Option<u32>) {}

fn exit_error(status: ExitStatus) -> Option<ExitError> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(ExitError::Status(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(ExitError::Signal(signal));
        }
    }
    Some(ExitError::Abnormal)
}
