mod config;

use common::auth::HttpCredentialVerifier;
use common::domain::{FanoutInsightNotifier, InsightNotifier};
use common::nats::{NatsClient, NatsInsightNotifier, NatsPhotoStore};
use common::postgres::{
    PostgresActivityRepository, PostgresClient, PostgresInsightRepository,
    PostgresOutboxRepository, PostgresProcessingRecordRepository,
};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use config::ServiceConfig;
use enrichment_worker::domain::{BackoffPolicy, EnrichmentConfig};
use enrichment_worker::enrichment_worker::{EnrichmentWorker, EnrichmentWorkerConfig};
use enrichment_worker::http::{HttpEnricher, HttpEnricherConfig};
use goose::MigrationRunner;
use ingest_api::domain::{ActivityIngestionService, IngestionConfig, InsightQueryService};
use ingest_api::ingest_api::{IngestApi, IngestApiConfig};
use nestling_runner::Runner;
use outbox_relay::domain::RelayConfig;
use outbox_relay::outbox_relay::{OutboxRelayWorker, OutboxRelayWorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {e}");
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        partition_count = config.partition_count,
        "starting nestling-all-in-one"
    );
    debug!("configuration: {config:?}");

    let (repositories, nats_client) = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("failed to initialize shared dependencies: {e}");
            std::process::exit(1);
        }
    };

    let pipeline = match build_pipeline(&config, &repositories, &nats_client).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("failed to build pipeline: {e}");
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new()
        .with_named_process("ingest_api", pipeline.ingest_api.into_runner_process())
        .with_named_process("outbox_relay", pipeline.outbox_relay.into_runner_process());

    for (i, process) in pipeline
        .enrichment_worker
        .into_runner_processes()
        .into_iter()
        .enumerate()
    {
        runner = runner.with_named_process(format!("enrichment_worker_{i}"), process);
    }

    runner = runner
        .with_closer({
            let nats_for_close = Arc::clone(&nats_client);
            move || async move {
                info!("running cleanup tasks");
                if let Ok(client) = Arc::try_unwrap(nats_for_close) {
                    client.close().await;
                }
                shutdown_telemetry(telemetry_providers);
                info!("cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    if let Err(e) = runner.run().await {
        error!("pipeline terminated with error: {e}");
        std::process::exit(1);
    }
}

struct Repositories {
    activities: Arc<PostgresActivityRepository>,
    outbox: Arc<PostgresOutboxRepository>,
    insights: Arc<PostgresInsightRepository>,
    processing_records: Arc<PostgresProcessingRecordRepository>,
}

struct Pipeline {
    ingest_api: IngestApi,
    outbox_relay: OutboxRelayWorker,
    enrichment_worker: EnrichmentWorker,
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(Repositories, Arc<NatsClient>)> {
    info!("initializing postgres");
    run_postgres_migrations(config).await?;
    let postgres_client = PostgresClient::new(
        &config.postgres_host,
        config.postgres_port,
        &config.postgres_database,
        &config.postgres_username,
        &config.postgres_password,
        config.postgres_max_pool_size,
    )?;
    postgres_client.ping().await?;

    let repositories = Repositories {
        activities: Arc::new(PostgresActivityRepository::new(postgres_client.clone())),
        outbox: Arc::new(PostgresOutboxRepository::new(postgres_client.clone())),
        insights: Arc::new(PostgresInsightRepository::new(postgres_client.clone())),
        processing_records: Arc::new(PostgresProcessingRecordRepository::new(postgres_client)),
    };

    info!("initializing nats");
    let nats_client = Arc::new(
        NatsClient::connect(
            &config.nats_url,
            Duration::from_secs(config.startup_timeout_secs),
        )
        .await?,
    );
    // Retention must cover the dedup window so replays stay deduplicatable.
    nats_client
        .ensure_stream(
            &config.activities_stream,
            Duration::from_secs(config.stream_max_age_days * 24 * 60 * 60),
        )
        .await?;

    Ok((repositories, nats_client))
}

async fn run_postgres_migrations(config: &ServiceConfig) -> anyhow::Result<()> {
    let dsn = format!(
        "postgres://{}:{}@{}:{}/{}?sslmode=disable",
        config.postgres_username,
        config.postgres_password,
        config.postgres_host,
        config.postgres_port,
        config.postgres_database
    );
    MigrationRunner::new(
        config.goose_binary_path.clone(),
        config.postgres_migrations_dir.clone(),
        "postgres".to_string(),
        dsn,
    )
    .run_migrations()
    .await
}

async fn build_pipeline(
    config: &ServiceConfig,
    repositories: &Repositories,
    nats_client: &Arc<NatsClient>,
) -> anyhow::Result<Pipeline> {
    // Ingest boundary
    let photo_store = Arc::new(NatsPhotoStore::new(nats_client.jetstream(), &config.photo_bucket).await?);
    let credential_verifier = Arc::new(HttpCredentialVerifier::new(
        config.identity_verify_url.clone(),
        Duration::from_secs(config.identity_timeout_secs),
    )?);
    let ingestion = Arc::new(ActivityIngestionService::new(
        credential_verifier,
        repositories.activities.clone(),
        photo_store,
        IngestionConfig {
            dedup_window: chrono::Duration::days(config.dedup_window_days as i64),
            submit_timeout: Duration::from_secs(config.submit_timeout_secs),
        },
    ));
    let insight_query = Arc::new(InsightQueryService::new(repositories.insights.clone()));
    let ingest_api = IngestApi::new(
        ingestion,
        insight_query,
        IngestApiConfig {
            host: config.http_host.clone(),
            port: config.http_port,
        },
    );

    // Outbox relay
    let outbox_relay = OutboxRelayWorker::new(
        repositories.outbox.clone(),
        nats_client.create_publisher_client(),
        OutboxRelayWorkerConfig {
            stream_name: config.activities_stream.clone(),
            partition_count: config.partition_count,
            relay: RelayConfig {
                batch_size: config.outbox_batch_size,
                poll_interval: Duration::from_millis(config.outbox_poll_interval_ms),
                retry_delay: Duration::from_secs(config.outbox_retry_delay_secs),
            },
        },
    );

    // Enrichment worker pool
    let enricher = Arc::new(HttpEnricher::new(HttpEnricherConfig {
        base_url: config.ai_endpoint.clone(),
        api_key: config.ai_api_key.clone(),
        request_timeout: Duration::from_secs(config.ai_call_timeout_secs),
    })?);
    let notifier: Arc<dyn InsightNotifier> = Arc::new(FanoutInsightNotifier::new(vec![Arc::new(
        NatsInsightNotifier::new(
            nats_client.create_core_publisher(),
            config.insight_subject_prefix.clone(),
        ),
    )]));
    let enrichment_worker = EnrichmentWorker::new(
        repositories.processing_records.clone(),
        repositories.insights.clone(),
        repositories.activities.clone(),
        enricher,
        notifier,
        nats_client.create_consumer_client(),
        EnrichmentWorkerConfig {
            stream_name: config.activities_stream.clone(),
            partition_count: config.partition_count,
            consumer_group: config.consumer_group.clone(),
            nats_batch_size: config.nats_batch_size,
            nats_batch_wait_secs: config.nats_batch_wait_secs,
            max_inflight_ai_calls: config.max_inflight_ai_calls,
            enrichment: EnrichmentConfig {
                worker_id: config.worker_id.clone(),
                ai_call_timeout: Duration::from_secs(config.ai_call_timeout_secs),
                lease_duration: chrono::Duration::seconds(config.lease_duration_secs as i64),
                max_attempts: config.max_attempts,
                recent_activity_limit: config.recent_activity_limit,
                backoff: BackoffPolicy {
                    base: Duration::from_secs(config.backoff_base_secs),
                    max: Duration::from_secs(config.backoff_max_secs),
                },
                max_cas_retries: config.max_cas_retries,
            },
        },
    )
    .await?;

    Ok(Pipeline {
        ingest_api,
        outbox_relay,
        enrichment_worker,
    })
}
