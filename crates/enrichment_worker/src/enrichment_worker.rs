use crate::domain::{EnrichmentConfig, EnrichmentService};
use crate::nats::EnvelopeConsumerService;
use common::domain::{
    ActivityRepository, Enricher, InsightNotifier, InsightRepository, ProcessingRecordRepository,
};
use common::nats::{JetStreamConsumer, NatsConsumer};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct EnrichmentWorkerConfig {
    pub stream_name: String,
    /// Number of partition subjects; one durable consumer is bound to each.
    pub partition_count: u32,
    /// Prefix for durable consumer names (`{prefix}-p{partition}`).
    pub consumer_group: String,
    pub nats_batch_size: usize,
    pub nats_batch_wait_secs: u64,
    /// Global bound on in-flight AI calls across every partition consumer of
    /// this pool instance.
    pub max_inflight_ai_calls: usize,
    pub enrichment: EnrichmentConfig,
}

/// The worker pool: one sequentially-processed consumer per partition, all
/// sharing one enrichment service and one admission semaphore.
///
/// Partition subjects serialize per-subject work without locks; the shared
/// semaphore turns AI-capability scarcity into broker-side queuing.
pub struct EnrichmentWorker {
    consumers: Vec<NatsConsumer<EnvelopeConsumerService>>,
}

impl EnrichmentWorker {
    pub async fn new(
        record_repository: Arc<dyn ProcessingRecordRepository>,
        insight_repository: Arc<dyn InsightRepository>,
        activity_repository: Arc<dyn ActivityRepository>,
        enricher: Arc<dyn Enricher>,
        notifier: Arc<dyn InsightNotifier>,
        jetstream: Arc<dyn JetStreamConsumer>,
        config: EnrichmentWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!(
            partition_count = config.partition_count,
            max_inflight_ai_calls = config.max_inflight_ai_calls,
            "initializing enrichment worker pool"
        );

        let ai_limiter = Arc::new(Semaphore::new(config.max_inflight_ai_calls));
        let service = Arc::new(EnrichmentService::new(
            record_repository,
            insight_repository,
            activity_repository,
            enricher,
            notifier,
            ai_limiter,
            config.enrichment,
        )?);

        let mut consumers = Vec::with_capacity(config.partition_count as usize);
        for partition in 0..config.partition_count {
            let consumer = NatsConsumer::new(
                jetstream.clone(),
                &config.stream_name,
                &format!("{}-p{partition}", config.consumer_group),
                &format!("{}.p{partition}", config.stream_name),
                config.nats_batch_size,
                config.nats_batch_wait_secs,
                EnvelopeConsumerService::new(service.clone()),
            )
            .await?;
            consumers.push(consumer);
        }

        info!("enrichment worker pool initialized");
        Ok(Self { consumers })
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_processes(
        self,
    ) -> Vec<
        Box<
            dyn FnOnce(
                    CancellationToken,
                ) -> std::pin::Pin<
                    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
                > + Send,
        >,
    > {
        self.consumers
            .into_iter()
            .map(|consumer| {
                let process: Box<
                    dyn FnOnce(
                            CancellationToken,
                        ) -> std::pin::Pin<
                            Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
                        > + Send,
                > = Box::new(move |ctx| Box::pin(async move { consumer.run(ctx).await }));
                process
            })
            .collect()
    }
}
