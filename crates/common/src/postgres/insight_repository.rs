use crate::domain::{
    DomainError, DomainResult, GetLatestInsightRepoInput, Insight, InsightRepository,
    InsightStatus,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, instrument};

/// PostgreSQL implementation of `InsightRepository`.
///
/// The upsert is an optimistic-concurrency insert: a new version row lands
/// only when no row with an equal-or-higher version exists for the
/// (subject, derivation key) pair. Every version is retained; `get_latest`
/// serves the highest one only.
#[derive(Clone)]
pub struct PostgresInsightRepository {
    client: PostgresClient,
}

impl PostgresInsightRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    async fn current_version(
        conn: &deadpool_postgres::Client,
        subject_id: &str,
        derivation_key: &str,
    ) -> DomainResult<u32> {
        let row = conn
            .query_one(
                "SELECT COALESCE(MAX(version), 0) AS version
                 FROM insights WHERE subject_id = $1 AND derivation_key = $2",
                &[&subject_id, &derivation_key],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;
        Ok(row.get::<_, i32>("version") as u32)
    }
}

fn row_to_insight(row: &Row) -> DomainResult<Insight> {
    let derived_value: serde_json::Value = row.get("derived_from");
    let derived_from: BTreeSet<String> = serde_json::from_value(derived_value)
        .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("corrupt derived_from: {e}")))?;

    let status_raw: String = row.get("status");
    let status = InsightStatus::parse(&status_raw).ok_or_else(|| {
        DomainError::RepositoryError(anyhow::anyhow!("unknown insight status: {status_raw}"))
    })?;

    Ok(Insight {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        derivation_key: row.get("derivation_key"),
        derived_from,
        version: row.get::<_, i32>("version") as u32,
        content: row.get("content"),
        status,
        generated_at: row.get::<_, DateTime<Utc>>("generated_at"),
    })
}

#[async_trait]
impl InsightRepository for PostgresInsightRepository {
    #[instrument(skip(self, insight), fields(subject_id = %insight.subject_id, derivation_key = %insight.derivation_key, version = insight.version))]
    async fn upsert(&self, insight: &Insight) -> DomainResult<u32> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let derived_from = serde_json::to_value(&insight.derived_from)
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("derived_from encode: {e}")))?;
        let version = insight.version as i32;

        let result = conn
            .execute(
                "INSERT INTO insights
                     (id, subject_id, derivation_key, version, derived_from, content, status, generated_at)
                 SELECT $1, $2, $3, $4, $5, $6, $7, $8
                 WHERE NOT EXISTS (
                     SELECT 1 FROM insights
                     WHERE subject_id = $2 AND derivation_key = $3 AND version >= $4
                 )",
                &[
                    &insight.id,
                    &insight.subject_id,
                    &insight.derivation_key,
                    &version,
                    &derived_from,
                    &insight.content,
                    &insight.status.as_str(),
                    &insight.generated_at,
                ],
            )
            .await;

        let inserted = match result {
            Ok(count) => count,
            // Two writers proposing the same version race past the NOT EXISTS
            // guard; the primary key settles it and the loser sees a
            // unique-violation, which is the same conflict.
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => 0,
            Err(e) => return Err(DomainError::RepositoryError(e.into())),
        };

        if inserted == 0 {
            let current =
                Self::current_version(&conn, &insight.subject_id, &insight.derivation_key).await?;
            return Err(DomainError::VersionConflict {
                derivation_key: insight.derivation_key.clone(),
                current_version: current,
            });
        }

        debug!("insight version committed");
        Ok(insight.version)
    }

    #[instrument(skip(self, input), fields(subject_id = %input.subject_id, derivation_key = %input.derivation_key))]
    async fn get_latest(
        &self,
        input: GetLatestInsightRepoInput,
    ) -> DomainResult<Option<Insight>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT id, subject_id, derivation_key, version, derived_from, content, status, generated_at
                 FROM insights
                 WHERE subject_id = $1 AND derivation_key = $2
                 ORDER BY version DESC
                 LIMIT 1",
                &[&input.subject_id, &input.derivation_key],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.as_ref().map(row_to_insight).transpose()
    }
}
