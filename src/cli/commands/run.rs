//! Broker-backed worker command.

use queue_worker::config::Settings;

#[cfg(feature = "amqp-broker")]
pub async fn cmd_run(settings: &Settings) -> anyhow::Result<()> {
    use std::sync::Arc;

    use anyhow::Context;
    use console::style;

    use crate::cli::icons::{dim_arrow, info, success, warn};
    use queue_worker::shutdown::install_shutdown_handler;
    use queue_worker::work_queue::{consumer_tag, AmqpQueue};
    use queue_worker::worker::QueueWorker;

    let broker_url = settings.broker_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("No broker configured. Set BROKER_URL or broker_url in the config file.")
    })?;

    settings.ensure_directories()?;
    let executor = settings.build_executor()?;

    let prefetch = u16::try_from(settings.concurrency).unwrap_or(u16::MAX);
    let queue = AmqpQueue::connect(broker_url, &settings.queue_name, prefetch, &consumer_tag())
        .await
        .context("Failed to connect to broker")?;

    println!(
        "{} Consuming '{}' with {} worker(s)",
        info(),
        style(&settings.queue_name).bold(),
        settings.concurrency
    );
    println!(
        "  {} Logs staged in {}",
        dim_arrow(),
        settings.logs_dir.display()
    );

    let shutdown = install_shutdown_handler();
    let summary = QueueWorker::new(Arc::new(queue), executor)
        .with_concurrency(settings.concurrency)
        .run(shutdown)
        .await
        .context("Queue subscription failed")?;

    println!(
        "{} Stopped after {} job(s): {} succeeded, {} failed",
        success(),
        summary.total(),
        summary.resolved,
        summary.rejected
    );
    if summary.settle_errors > 0 {
        println!(
            "{} {} job(s) could not be acknowledged and will be redelivered",
            warn(),
            summary.settle_errors
        );
    }

    Ok(())
}

#[cfg(not(feature = "amqp-broker"))]
pub async fn cmd_run(_settings: &Settings) -> anyhow::Result<()> {
    anyhow::bail!(
        "This build has no broker support. Rebuild with `--features amqp-broker`, \
         or use `exec` to run jobs locally."
    )
}
