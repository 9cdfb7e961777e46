use crate::domain::{OutboxRelayService, RelayConfig};
use crate::nats::NatsEnvelopeProducer;
use common::domain::OutboxRepository;
use common::nats::JetStreamPublisher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct OutboxRelayWorkerConfig {
    pub stream_name: String,
    pub partition_count: u32,
    pub relay: RelayConfig,
}

/// Module wiring: outbox repository + envelope producer under the relay loop.
pub struct OutboxRelayWorker {
    service: OutboxRelayService,
}

impl OutboxRelayWorker {
    pub fn new(
        outbox_repository: Arc<dyn OutboxRepository>,
        jetstream: Arc<dyn JetStreamPublisher>,
        config: OutboxRelayWorkerConfig,
    ) -> Self {
        debug!("initializing outbox relay module");

        let producer = Arc::new(NatsEnvelopeProducer::new(
            jetstream,
            config.stream_name,
            config.partition_count,
        ));

        Self {
            service: OutboxRelayService::new(outbox_repository, producer, config.relay),
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new(move |ctx| {
            let service = self.service;
            Box::pin(async move { service.run(ctx).await })
        })
    }
}
