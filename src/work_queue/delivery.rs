//! Delivery: one job handed out by a queue, plus the capability to settle it.

use async_trait::async_trait;

use super::QueueError;

/// Backend-specific acknowledgement channel for a single delivery.
///
/// `Delivery` guarantees `resolve` or `reject` is called at most once, so
/// implementations do not need to guard against repeats.
#[async_trait]
pub trait CompletionSink: Send {
    /// Report processing progress (0-100). Backends without progress
    /// tracking ignore it.
    async fn progress(&mut self, _percent: u8) -> Result<(), QueueError> {
        Ok(())
    }

    /// The job finished; remove it from the queue.
    async fn resolve(&mut self) -> Result<(), QueueError>;

    /// The job failed; hand it back to the queue's failure policy.
    async fn reject(&mut self, reason: &str) -> Result<(), QueueError>;
}

/// A delivered job. Move semantics: consumed by `resolve()` or `reject()`.
///
/// If dropped without being settled, logs a warning. The queue's own
/// redelivery (lease expiry, channel close) is the real safety net.
pub struct Delivery {
    label: String,
    payload: Vec<u8>,
    sink: Option<Box<dyn CompletionSink>>,
}

impl Delivery {
    pub fn new(
        label: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        sink: Box<dyn CompletionSink>,
    ) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
            sink: Some(sink),
        }
    }

    /// Backend identifier for this delivery (delivery tag, sequence number).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn progress(&mut self, percent: u8) -> Result<(), QueueError> {
        match self.sink.as_mut() {
            Some(sink) => sink.progress(percent.min(100)).await,
            None => Err(QueueError::Closed),
        }
    }

    /// Acknowledge the job.
    pub async fn resolve(mut self) -> Result<(), QueueError> {
        match self.sink.take() {
            Some(mut sink) => sink.resolve().await,
            None => Err(QueueError::Closed),
        }
    }

    /// Reject the job with a reason.
    pub async fn reject(mut self, reason: &str) -> Result<(), QueueError> {
        match self.sink.take() {
            Some(mut sink) => sink.reject(reason).await,
            None => Err(QueueError::Closed),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("label", &self.label)
            .field("payload_bytes", &self.payload.len())
            .field("settled", &self.sink.is_none())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.sink.is_some() {
            tracing::warn!(
                "Delivery {} dropped without being resolved or rejected; \
                 the queue will redeliver it",
                self.label
            );
        }
    }
}
