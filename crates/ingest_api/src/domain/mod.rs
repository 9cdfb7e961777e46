mod activity_ingestion_service;
mod insight_query_service;

pub use activity_ingestion_service::{
    ActivityIngestionService, IngestionConfig, SubmitActivityInput, SubmitActivityOutcome,
};
pub use insight_query_service::{GetLatestInsightInput, InsightQueryService};
