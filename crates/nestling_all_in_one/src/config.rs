use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Telemetry
    /// Service name reported to the trace backend
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    /// OTLP collector endpoint
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Whether to export spans over OTLP
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream stream carrying activity envelopes
    #[serde(default = "default_activities_stream")]
    pub activities_stream: String,

    /// Number of partition subjects under the activities stream
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Stream retention; must cover the processing-record dedup window
    #[serde(default = "default_stream_max_age_days")]
    pub stream_max_age_days: u64,

    /// Durable consumer name prefix for the worker pool
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Batch size for pull consumers
    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    /// Max wait time for batches in seconds
    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    /// Object store bucket for photo binaries
    #[serde(default = "default_photo_bucket")]
    pub photo_bucket: String,

    /// Core-NATS subject prefix for insight notifications
    #[serde(default = "default_insight_subject_prefix")]
    pub insight_subject_prefix: String,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    /// Path to PostgreSQL migrations directory
    #[serde(default = "default_postgres_migrations_dir")]
    pub postgres_migrations_dir: String,

    /// Path to the goose binary
    #[serde(default = "default_goose_binary_path")]
    pub goose_binary_path: String,

    // HTTP ingest boundary
    #[serde(default = "default_http_host")]
    pub http_host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Idempotency dedup window in days
    #[serde(default = "default_dedup_window_days")]
    pub dedup_window_days: u64,

    /// End-to-end bound on one submit (object store + transaction) in seconds
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    // External identity provider
    /// Introspection endpoint for bearer credentials
    #[serde(default = "default_identity_verify_url")]
    pub identity_verify_url: String,

    #[serde(default = "default_identity_timeout_secs")]
    pub identity_timeout_secs: u64,

    // AI capability
    /// Base URL of the enrichment service
    #[serde(default = "default_ai_endpoint")]
    pub ai_endpoint: String,

    /// Credential for the enrichment service, if it expects one
    #[serde(default)]
    pub ai_api_key: Option<String>,

    /// Per-call bound on the AI capability in seconds; must stay shorter
    /// than the lease
    #[serde(default = "default_ai_call_timeout_secs")]
    pub ai_call_timeout_secs: u64,

    /// Global cap on in-flight AI calls per pool instance
    #[serde(default = "default_max_inflight_ai_calls")]
    pub max_inflight_ai_calls: usize,

    // Worker pool
    /// Lease ownership identity; unique per process by default
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Processing lease duration in seconds
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,

    /// Claims beyond this count dead-letter the envelope
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Recent-history window handed to the AI capability
    #[serde(default = "default_recent_activity_limit")]
    pub recent_activity_limit: usize,

    /// Exponential backoff base in seconds
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Exponential backoff cap in seconds
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Bound on the insight version-CAS resolve loop
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    // Outbox relay
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: usize,

    /// Idle wait between relay polls in milliseconds
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    /// Wait before retrying a failed relay pass in seconds
    #[serde(default = "default_outbox_retry_delay_secs")]
    pub outbox_retry_delay_secs: u64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("NESTLING"))
            .build()?
            .try_deserialize()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_service_name() -> String {
    "nestling-all-in-one".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_activities_stream() -> String {
    "activities".to_string()
}

fn default_partition_count() -> u32 {
    8
}

fn default_stream_max_age_days() -> u64 {
    30
}

fn default_consumer_group() -> String {
    "enrichment".to_string()
}

fn default_nats_batch_size() -> usize {
    10
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_photo_bucket() -> String {
    "photos".to_string()
}

fn default_insight_subject_prefix() -> String {
    "insights.ready".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "nestling".to_string()
}

fn default_postgres_username() -> String {
    "nestling".to_string()
}

fn default_postgres_password() -> String {
    "nestling".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_postgres_migrations_dir() -> String {
    "migrations/postgres".to_string()
}

fn default_goose_binary_path() -> String {
    "goose".to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_dedup_window_days() -> u64 {
    30
}

fn default_submit_timeout_secs() -> u64 {
    10
}

fn default_identity_verify_url() -> String {
    "http://localhost:9100/v1/verify".to_string()
}

fn default_identity_timeout_secs() -> u64 {
    5
}

fn default_ai_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_ai_call_timeout_secs() -> u64 {
    30
}

fn default_max_inflight_ai_calls() -> usize {
    4
}

fn default_worker_id() -> String {
    format!("enrichment-{}", uuid::Uuid::new_v4())
}

fn default_lease_duration_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_recent_activity_limit() -> usize {
    20
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_max_cas_retries() -> u32 {
    3
}

fn default_outbox_batch_size() -> usize {
    50
}

fn default_outbox_poll_interval_ms() -> u64 {
    500
}

fn default_outbox_retry_delay_secs() -> u64 {
    5
}
