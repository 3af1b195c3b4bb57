//! RabbitMQ-backed job queue (requires the `amqp-broker` feature).
//!
//! Resolving a delivery acks it. Rejecting nacks it without requeue, so the
//! broker's dead-letter or retry policy decides what happens next.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info, warn};

use super::{CompletionSink, Delivery, JobQueue, QueueError};

const REPLY_SUCCESS: u16 = 200;

pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    consumer: tokio::sync::Mutex<Consumer>,
    consumer_tag: String,
}

impl AmqpQueue {
    /// Connect, declare `queue_name` as durable, and start consuming.
    ///
    /// `prefetch` bounds how many unacknowledged deliveries the broker hands
    /// this worker at once; it should match the worker's concurrency.
    pub async fn connect(
        url: &str,
        queue_name: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(format!("{}: {}", redact(url), e)))?;
        let channel = connection.create_channel().await?;

        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let consumer = channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            "Subscribed to queue '{}' at {} as {}",
            queue_name,
            redact(url),
            consumer_tag
        );

        Ok(Self {
            connection,
            channel,
            consumer: tokio::sync::Mutex::new(consumer),
            consumer_tag: consumer_tag.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for AmqpQueue {
    async fn next_delivery(&self) -> Result<Option<Delivery>, QueueError> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            Some(Ok(delivery)) => {
                let label = delivery.delivery_tag.to_string();
                if delivery.redelivered {
                    debug!("Delivery {} is a redelivery", label);
                }
                let sink = AmqpCompletion {
                    acker: delivery.acker,
                };
                Ok(Some(Delivery::new(label, delivery.data, Box::new(sink))))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Cancel the consumer, then close the channel and connection. Every step
    /// runs even if an earlier one failed; the first error is returned.
    async fn shutdown(&self) -> Result<(), QueueError> {
        let cancelled = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await;
        let channel_closed = self.channel.close(REPLY_SUCCESS, "worker shutdown").await;
        let connection_closed = self
            .connection
            .close(REPLY_SUCCESS, "worker shutdown")
            .await;

        first_error([
            ("cancel consumer", cancelled),
            ("close channel", channel_closed),
            ("close connection", connection_closed),
        ])
    }
}

/// Log every failed step and return the first failure.
fn first_error<E>(steps: [(&str, Result<(), E>); 3]) -> Result<(), QueueError>
where
    E: Into<QueueError> + std::fmt::Display,
{
    let mut first = None;
    for (step, result) in steps {
        if let Err(e) = result {
            warn!("AMQP shutdown: failed to {}: {}", step, e);
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

struct AmqpCompletion {
    acker: Acker,
}

#[async_trait]
impl CompletionSink for AmqpCompletion {
    async fn resolve(&mut self) -> Result<(), QueueError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&mut self, reason: &str) -> Result<(), QueueError> {
        warn!("Rejecting delivery: {}", reason);
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await?;
        Ok(())
    }
}

/// Strip credentials from a broker URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
