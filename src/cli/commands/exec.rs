//! Run jobs locally through an in-memory queue.

use std::sync::Arc;

use console::style;

use crate::cli::icons::{error, info, success};
use queue_worker::config::Settings;
use queue_worker::job::JobPayload;
use queue_worker::shutdown::install_shutdown_handler;
use queue_worker::work_queue::{MemoryQueue, Settlement};
use queue_worker::worker::QueueWorker;

/// Process each identity once and print its outcome.
pub async fn cmd_exec(settings: &Settings, identities: &[String]) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let executor = settings.build_executor()?;

    let queue = Arc::new(MemoryQueue::new());
    for identity in identities {
        queue.enqueue_job(&JobPayload::new(identity.as_str()))?;
    }
    queue.close();

    println!("{} Processing {} job(s)", info(), identities.len());

    let summary = QueueWorker::new(queue.clone(), executor)
        .with_concurrency(settings.concurrency)
        .run(install_shutdown_handler())
        .await?;

    for completion in queue.completions() {
        let name = JobPayload::from_slice(&completion.payload)
            .map(|payload| payload.filename)
            .unwrap_or(completion.label);
        match completion.settlement {
            Settlement::Resolved => println!("  {} {}", success(), name),
            Settlement::Rejected(reason) => {
                println!("  {} {}: {}", error(), name, style(reason).dim())
            }
        }
    }

    let skipped = queue.pending();
    if skipped > 0 {
        println!("{} {} job(s) not started (interrupted)", error(), skipped);
    }

    let failed = summary.rejected + summary.settle_errors;
    if failed > 0 || skipped > 0 {
        anyhow::bail!("{} of {} job(s) did not succeed", failed + skipped, identities.len());
    }
    Ok(())
}
