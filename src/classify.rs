//! Decides whether a run succeeded.
//!
//! The exit code alone is not enough: the processor can exit 0 after printing
//! an unhandled exception. A run only counts as successful when it exited
//! cleanly *and* its stderr is free of the fault signature.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::runner::{ExecutionResult, ExitError};

/// Marker printed by Python at the start of an unhandled exception.
pub const DEFAULT_FAULT_SIGNATURE: &str = "Traceback";

static DEFAULT_SIGNATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_FAULT_SIGNATURE).unwrap());

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The processor could not start or exited abnormally.
    ProcessError(ExitError),
    /// The processor exited 0 but stderr carried the fault signature.
    DetectedFault { signature: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessError(e) => write!(f, "process error: {}", e),
            Self::DetectedFault { signature } => {
                write!(f, "fault signature '{}' found in stderr", signature)
            }
        }
    }
}

/// Final determination for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    signature: Regex,
}

impl Default for OutcomeClassifier {
    fn default() -> Self {
        Self {
            signature: DEFAULT_SIGNATURE.clone(),
        }
    }
}

impl OutcomeClassifier {
    /// Classifier using a custom fault signature (a regular expression).
    pub fn new(signature: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            signature: Regex::new(signature)?,
        })
    }

    pub fn signature(&self) -> &str {
        self.signature.as_str()
    }

    pub fn classify(&self, result: &ExecutionResult) -> Outcome {
        if let Some(ref e) = result.exit_error {
            return Outcome::Failure(FailureReason::ProcessError(e.clone()));
        }

        let stderr = String::from_utf8_lossy(&result.stderr);
        if self.signature.is_match(&stderr) {
            return Outcome::Failure(FailureReason::DetectedFault {
                signature: self.signature.as_str().to_string(),
            });
        }

        Outcome::Success
    }
}
