use async_trait::async_trait;
use common::domain::{
    partition_for, DomainError, DomainResult, Envelope, EnvelopePublisher,
};
use common::nats::JetStreamPublisher;
use common::proto::envelope_to_wire;
use prost::Message;
use std::sync::Arc;
use tracing::debug;

/// Publishes envelopes to the JetStream activities stream, one subject per
/// partition bucket so consumer assignment and ordering follow the subject.
pub struct NatsEnvelopeProducer {
    jetstream: Arc<dyn JetStreamPublisher>,
    stream_name: String,
    partition_count: u32,
}

impl NatsEnvelopeProducer {
    pub fn new(jetstream: Arc<dyn JetStreamPublisher>, stream_name: String, partition_count: u32) -> Self {
        debug!(
            stream = %stream_name,
            partition_count,
            "initialized NatsEnvelopeProducer"
        );
        Self {
            jetstream,
            stream_name,
            partition_count,
        }
    }
}

#[async_trait]
impl EnvelopePublisher for NatsEnvelopeProducer {
    async fn publish_envelope(&self, envelope: &Envelope) -> DomainResult<()> {
        let payload = envelope_to_wire(envelope).encode_to_vec();
        let bucket = partition_for(&envelope.partition_key, self.partition_count);
        let subject = format!("{}.p{}", self.stream_name, bucket);

        self.jetstream
            .publish(subject, payload.into())
            .await
            .map_err(DomainError::RepositoryError)?;

        Ok(())
    }
}
