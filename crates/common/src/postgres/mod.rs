mod activity_repository;
mod client;
mod config;
mod insight_repository;
mod outbox_repository;
mod processing_record_repository;

pub use activity_repository::PostgresActivityRepository;
pub use client::PostgresClient;
pub use config::PostgresConfig;
pub use insight_repository::PostgresInsightRepository;
pub use outbox_repository::PostgresOutboxRepository;
pub use processing_record_repository::PostgresProcessingRecordRepository;
