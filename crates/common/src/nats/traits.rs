use anyhow::Result;
use async_nats::jetstream;
use async_trait::async_trait;

/// Seam over JetStream consumer creation so consumer plumbing is testable
/// without a broker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// One durable pull consumer bound to a subject filter.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: std::time::Duration,
    ) -> Result<Vec<jetstream::Message>>;
}

/// Seam over JetStream publishing.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Publish and await the stream's ack.
    async fn publish(&self, subject: String, payload: bytes::Bytes) -> Result<()>;
}

/// Seam over fire-and-forget core-NATS publishing, used by best-effort
/// notification paths that must never block on broker persistence.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CorePublisher: Send + Sync {
    async fn publish(&self, subject: String, payload: bytes::Bytes) -> Result<()>;
}
