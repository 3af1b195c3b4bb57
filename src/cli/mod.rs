//! Command-line interface for queue-worker.

mod commands;
pub mod icons;

pub use commands::{is_verbose, run};
