use crate::nats::consumer_types::{ConsumeRequest, ConsumeResponse};
use crate::nats::traits::{JetStreamConsumer, PullConsumer};
use anyhow::{Context as _, Result};
use async_nats::jetstream;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

/// A durable pull consumer that feeds messages one at a time through a Tower
/// service.
///
/// Messages are processed strictly sequentially, which is what preserves
/// per-partition ordering: one `NatsConsumer` is bound to exactly one
/// partition subject and never interleaves two messages of that partition.
pub struct NatsConsumer<S> {
    consumer: Box<dyn PullConsumer>,
    stream_name: String,
    consumer_name: String,
    batch_size: usize,
    max_wait: Duration,
    service: S,
}

impl<S> NatsConsumer<S>
where
    S: Service<ConsumeRequest, Response = ConsumeResponse, Error = anyhow::Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    pub async fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        stream_name: &str,
        consumer_name: &str,
        subject_filter: &str,
        batch_size: usize,
        max_wait_secs: u64,
        service: S,
    ) -> Result<Self> {
        debug!(
            stream = %stream_name,
            consumer = %consumer_name,
            filter_subject = %subject_filter,
            "creating nats consumer"
        );

        let config = jetstream::consumer::pull::Config {
            name: Some(consumer_name.to_string()),
            durable_name: Some(consumer_name.to_string()),
            filter_subject: subject_filter.to_string(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };

        let consumer = jetstream
            .create_consumer(config, stream_name)
            .await
            .context("failed to create consumer")?;

        Ok(Self {
            consumer,
            stream_name: stream_name.to_string(),
            consumer_name: consumer_name.to_string(),
            batch_size,
            max_wait: Duration::from_secs(max_wait_secs),
            service,
        })
    }

    /// Pull-and-process until cancellation.
    pub async fn run(mut self, ctx: CancellationToken) -> Result<()> {
        debug!(
            stream = %self.stream_name,
            consumer = %self.consumer_name,
            "starting nats consumer"
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(
                        stream = %self.stream_name,
                        consumer = %self.consumer_name,
                        "received shutdown signal, stopping consumer"
                    );
                    break;
                }
                result = self.fetch_and_process_batch() => {
                    if let Err(e) = result {
                        error!(
                            stream = %self.stream_name,
                            consumer = %self.consumer_name,
                            error = %e,
                            "error processing batch"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        debug!(
            stream = %self.stream_name,
            consumer = %self.consumer_name,
            "consumer stopped gracefully"
        );
        Ok(())
    }

    async fn fetch_and_process_batch(&mut self) -> Result<()> {
        let raw_messages = self
            .consumer
            .fetch_messages(self.batch_size, self.max_wait)
            .await?;

        if raw_messages.is_empty() {
            return Ok(());
        }

        debug!(message_count = raw_messages.len(), "received message batch");

        for msg in &raw_messages {
            let request = ConsumeRequest::new(
                msg.subject.to_string(),
                Bytes::copy_from_slice(&msg.payload),
                msg.headers.clone(),
            );

            let response = match self.service.call(request).await {
                Ok(resp) => resp,
                Err(e) => {
                    error!(
                        subject = %msg.subject,
                        error = %e,
                        "service error processing message"
                    );
                    ConsumeResponse::nak(e.to_string())
                }
            };

            match response {
                ConsumeResponse::Ack => {
                    if let Err(e) = msg.ack().await {
                        error!(
                            subject = %msg.subject,
                            error = %e,
                            "failed to acknowledge message"
                        );
                    }
                }
                ConsumeResponse::Nak { reason, delay } => {
                    if let Some(ref r) = reason {
                        warn!(subject = %msg.subject, reason = %r, "rejecting message");
                    } else {
                        warn!(subject = %msg.subject, "rejecting message");
                    }

                    if let Err(e) = msg.ack_with(jetstream::AckKind::Nak(delay)).await {
                        error!(
                            subject = %msg.subject,
                            error = %e,
                            "failed to reject message"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
