use crate::domain::activity::Activity;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable publish intent written in the same transaction as the activity.
/// The row id doubles as the envelope sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: u64,
    pub partition_key: String,
    pub activity: Activity,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FetchUnpublishedRepoInput {
    pub limit: usize,
}

/// Repository trait for the outbox table. Only the relay marks rows
/// published; the ingest transaction is the only writer of new rows.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Unpublished rows in id order (oldest first).
    async fn fetch_unpublished(
        &self,
        input: FetchUnpublishedRepoInput,
    ) -> DomainResult<Vec<OutboxEntry>>;

    async fn mark_published(&self, ids: &[u64]) -> DomainResult<()>;
}
