//! Job queue abstraction: subscribe, receive deliveries, settle them.
//!
//! The worker only needs two things from a queue: the next delivery, and a
//! way to stop the subscription. Everything else (leasing, redelivery, retry
//! of rejected jobs) is the queue's own business. Settling a delivery goes
//! through the `Delivery` handle so each job is resolved or rejected exactly
//! once.

mod delivery;
mod error;
pub mod memory;

#[cfg(feature = "amqp-broker")]
pub mod amqp;

pub use delivery::{CompletionSink, Delivery};
pub use error::QueueError;
pub use memory::{Completion, MemoryQueue, Settlement};

#[cfg(feature = "amqp-broker")]
pub use amqp::AmqpQueue;

use async_trait::async_trait;

/// A live subscription to a job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` once the subscription has ended. Must be
    /// cancel-safe: the worker drops this future when shutdown begins, and
    /// no delivery may be lost when that happens.
    async fn next_delivery(&self) -> Result<Option<Delivery>, QueueError>;

    /// End the subscription. Deliveries not yet handed out stay queued.
    async fn shutdown(&self) -> Result<(), QueueError>;
}

/// Consumer tag identifying this worker process to the broker.
pub fn consumer_tag() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}-{}", host, std::process::id())
}
