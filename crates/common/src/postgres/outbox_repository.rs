use crate::domain::{
    Activity, DomainError, DomainResult, FetchUnpublishedRepoInput, OutboxEntry, OutboxRepository,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

/// PostgreSQL implementation of `OutboxRepository`. Rows are fetched in id
/// order so the relay preserves per-partition sequence ordering.
#[derive(Clone)]
pub struct PostgresOutboxRepository {
    client: PostgresClient,
}

impl PostgresOutboxRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    #[instrument(skip(self, input), fields(limit = input.limit))]
    async fn fetch_unpublished(
        &self,
        input: FetchUnpublishedRepoInput,
    ) -> DomainResult<Vec<OutboxEntry>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let limit = input.limit as i64;
        let rows = conn
            .query(
                "SELECT id, activity_id, partition_key, activity, created_at, published_at
                 FROM activity_outbox
                 WHERE published_at IS NULL
                 ORDER BY id
                 LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        rows.iter()
            .map(|row| {
                let activity_value: serde_json::Value = row.get("activity");
                let activity: Activity = serde_json::from_value(activity_value).map_err(|e| {
                    DomainError::RepositoryError(anyhow::anyhow!("corrupt outbox snapshot: {e}"))
                })?;
                Ok(OutboxEntry {
                    id: row.get::<_, i64>("id") as u64,
                    partition_key: row.get("partition_key"),
                    activity,
                    created_at: row.get::<_, DateTime<Utc>>("created_at"),
                    published_at: row.get::<_, Option<DateTime<Utc>>>("published_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn mark_published(&self, ids: &[u64]) -> DomainResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        conn.execute(
            "UPDATE activity_outbox SET published_at = $1 WHERE id = ANY($2)",
            &[&Utc::now(), &ids],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }
}
