//! Work queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Queue is closed")]
    Closed,
    #[cfg(feature = "amqp-broker")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("{0}")]
    Other(String),
}
