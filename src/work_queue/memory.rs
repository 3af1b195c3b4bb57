//! In-process job queue.
//!
//! Backs the `exec` command and the test suite. Settlements are recorded in a
//! ledger so callers can see what happened to each delivery.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{CompletionSink, Delivery, JobQueue, QueueError};
use crate::job::JobPayload;

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Resolved,
    Rejected(String),
}

/// Ledger entry for one settled delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub label: String,
    pub payload: Vec<u8>,
    pub settlement: Settlement,
}

#[derive(Debug, Default)]
struct Ledger {
    completions: Vec<Completion>,
    progress: Vec<(String, u8)>,
}

type Queued = (String, Vec<u8>);

pub struct MemoryQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>,
    stop: watch::Sender<bool>,
    next_seq: AtomicU64,
    queued: AtomicUsize,
    ledger: Arc<Mutex<Ledger>>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            stop,
            next_seq: AtomicU64::new(1),
            queued: AtomicUsize::new(0),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// Queue a raw payload. Returns the delivery label it will carry.
    pub fn enqueue(&self, payload: impl Into<Vec<u8>>) -> Result<String, QueueError> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = tx.as_ref().ok_or(QueueError::Closed)?;
        let label = format!("mem-{}", self.next_seq.fetch_add(1, Ordering::Relaxed));
        self.queued.fetch_add(1, Ordering::SeqCst);
        if tx.send((label.clone(), payload.into())).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(label)
    }

    /// Queue a job payload as JSON.
    pub fn enqueue_job(&self, job: &JobPayload) -> Result<String, QueueError> {
        let bytes = serde_json::to_vec(job).map_err(|e| QueueError::Other(e.to_string()))?;
        self.enqueue(bytes)
    }

    /// Accept no more jobs; the subscription ends once the backlog is drained.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Jobs queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Settled deliveries, in settlement order.
    pub fn completions(&self) -> Vec<Completion> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completions
            .clone()
    }

    /// Progress reports, in the order they were made.
    pub fn progress_reports(&self) -> Vec<(String, u8)> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .progress
            .clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn next_delivery(&self) -> Result<Option<Delivery>, QueueError> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            return Ok(None);
        }

        let received = tokio::select! {
            biased;
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => None,
            item = async { self.rx.lock().await.recv().await } => item,
        };

        Ok(received.map(|(label, payload)| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            let sink = MemoryCompletion {
                label: label.clone(),
                payload: payload.clone(),
                ledger: Arc::clone(&self.ledger),
            };
            Delivery::new(label, payload, Box::new(sink))
        }))
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        self.stop.send_replace(true);
        Ok(())
    }
}

struct MemoryCompletion {
    label: String,
    payload: Vec<u8>,
    ledger: Arc<Mutex<Ledger>>,
}

impl MemoryCompletion {
    fn settle(&self, settlement: Settlement) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completions
            .push(Completion {
                label: self.label.clone(),
                payload: self.payload.clone(),
                settlement,
            });
    }
}

#[async_trait]
impl CompletionSink for MemoryCompletion {
    async fn progress(&mut self, percent: u8) -> Result<(), QueueError> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .progress
            .push((self.label.clone(), percent));
        Ok(())
    }

    async fn resolve(&mut self) -> Result<(), QueueError> {
        self.settle(Settlement::Resolved);
        Ok(())
    }

    async fn reject(&mut self, reason: &str) -> Result<(), QueueError> {
        self.settle(Settlement::Rejected(reason.to_string()));
        Ok(())
    }
}
