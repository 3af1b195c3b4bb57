//! Job payloads, validated identities, and terminal status values.
//!
//! A job's identity names its unit of work (typically a filename). It keys the
//! staging log directory and the status record, and it is passed as the final
//! argument to external commands, so it is validated before anything uses it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identity accepted (a typical filesystem name limit).
pub const MAX_IDENTITY_LEN: usize = 255;

/// Reasons an identity is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("job identity is empty")]
    Empty,

    #[error("job identity is {0} bytes long (limit 255)")]
    TooLong(usize),

    #[error("job identity '{0}' is a reserved path component")]
    Reserved(String),

    #[error("job identity '{0}' must not start with '-'")]
    LeadingDash(String),

    #[error("job identity '{identity}' contains disallowed character {ch:?}")]
    InvalidChar { identity: String, ch: char },
}

/// Errors decoding a queue payload into a job.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed job payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Identity of a job, safe to use as a path component and a command argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobIdentity(String);

impl JobIdentity {
    /// Validate a raw identity.
    ///
    /// Accepts ASCII letters, digits, `.`, `_` and `-`. Rejects leading dashes
    /// (they would read as flags) and the `.`/`..` path components.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        if raw.is_empty() {
            return Err(IdentityError::Empty);
        }
        if raw.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong(raw.len()));
        }
        if raw == "." || raw == ".." {
            return Err(IdentityError::Reserved(raw.to_string()));
        }
        if raw.starts_with('-') {
            return Err(IdentityError::LeadingDash(raw.to_string()));
        }
        if let Some(ch) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(IdentityError::InvalidChar {
                identity: raw.to_string(),
                ch,
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Body of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Unit of work, usually the name of the file to process.
    #[serde(alias = "identity")]
    pub filename: String,
}

impl JobPayload {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// Decode a JSON payload as delivered by the queue.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Validated identity of this job.
    pub fn identity(&self) -> Result<JobIdentity, IdentityError> {
        JobIdentity::parse(&self.filename)
    }
}

/// Terminal status recorded in the external status system.
///
/// The worker only ever sets `Failed`; other values belong to the status
/// system and pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Failed,
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
