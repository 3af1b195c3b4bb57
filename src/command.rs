//! External command specifications.
//!
//! Every collaborator the worker shells out to (the processor, the log
//! uploader, the status recorder) is described by a program plus a fixed
//! argument list. Per-job values are appended as separate arguments, never
//! spliced into a shell string.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// A program and its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute (looked up in PATH unless it contains a separator).
    pub command: String,
    /// Arguments placed before the per-invocation arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Shorthand for `sh <script>`.
    pub fn shell_script(script: &str) -> Self {
        Self::new("sh", [script])
    }

    /// Build a command with `extra` appended after the configured arguments.
    ///
    /// stdin is closed, stdout and stderr are piped for capture.
    pub fn build<I, S>(&self, extra: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Human-readable command line for logs.
    pub fn display_with(&self, extra: &[&str]) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(extra.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether the program can be found.
    pub fn is_available(&self) -> bool {
        let path = Path::new(&self.command);
        if path.components().count() > 1 {
            path.is_file()
        } else {
            which::which(&self.command).is_ok()
        }
    }
}
