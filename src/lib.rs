//! queue-worker - queue-driven job worker.
//!
//! Core library: the per-job pipeline (run, classify, archive, report) and the
//! worker that feeds it from a job queue.

pub mod archive;
pub mod classify;
pub mod command;
pub mod config;
pub mod executor;
pub mod job;
pub mod runner;
pub mod shutdown;
pub mod status;
pub mod work_queue;
pub mod worker;
