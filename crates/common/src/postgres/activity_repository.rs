use crate::domain::{
    Activity, ActivityPayload, ActivityRepository, CreateActivityRepoInput,
    CreateActivityRepoOutcome, DomainError, DomainResult, GetByIdempotencyKeyRepoInput,
    ListRecentForSubjectRepoInput,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tracing::{debug, instrument};

/// PostgreSQL implementation of `ActivityRepository`.
///
/// The create path writes the activity row and its outbox row in one
/// transaction; the unique index on `idempotency_key` closes the
/// check-then-insert race between concurrent submits.
#[derive(Clone)]
pub struct PostgresActivityRepository {
    client: PostgresClient,
}

impl PostgresActivityRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

fn row_to_activity(row: &Row) -> DomainResult<Activity> {
    let payload_value: serde_json::Value = row.get("payload");
    let payload: ActivityPayload = serde_json::from_value(payload_value)
        .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("corrupt payload column: {e}")))?;

    Ok(Activity {
        id: row.get("activity_id"),
        subject_id: row.get("subject_id"),
        payload,
        occurred_at: row.get::<_, DateTime<Utc>>("occurred_at"),
        recorded_at: row.get::<_, DateTime<Utc>>("recorded_at"),
        idempotency_key: row.get("idempotency_key"),
    })
}

#[async_trait]
impl ActivityRepository for PostgresActivityRepository {
    #[instrument(skip(self, input), fields(activity_id = %input.activity.id, subject_id = %input.activity.subject_id))]
    async fn create_with_outbox(
        &self,
        input: CreateActivityRepoInput,
    ) -> DomainResult<CreateActivityRepoOutcome> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let activity = &input.activity;
        let payload_json = serde_json::to_value(&activity.payload)
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("payload encode: {e}")))?;

        let inserted = tx
            .execute(
                "INSERT INTO activities (activity_id, subject_id, kind, payload, occurred_at, recorded_at, idempotency_key)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (idempotency_key) DO NOTHING",
                &[
                    &activity.id,
                    &activity.subject_id,
                    &activity.kind().as_str(),
                    &payload_json,
                    &activity.occurred_at,
                    &activity.recorded_at,
                    &activity.idempotency_key,
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if inserted == 0 {
            // Lost the unique-index race: another submit with the same key
            // committed first. Return its activity, publish nothing.
            let row = tx
                .query_one(
                    "SELECT activity_id, subject_id, kind, payload, occurred_at, recorded_at, idempotency_key
                     FROM activities WHERE idempotency_key = $1",
                    &[&activity.idempotency_key],
                )
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?;
            let existing = row_to_activity(&row)?;

            tx.commit()
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?;
            debug!(idempotency_key = %activity.idempotency_key, "duplicate idempotency key, no outbox row written");
            return Ok(CreateActivityRepoOutcome::Duplicate { existing });
        }

        let activity_snapshot = serde_json::to_value(activity)
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("activity encode: {e}")))?;

        tx.execute(
            "INSERT INTO activity_outbox (activity_id, partition_key, activity, created_at)
             VALUES ($1, $2, $3, $4)",
            &[
                &activity.id,
                &input.partition_key,
                &activity_snapshot,
                &activity.recorded_at,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        tx.commit()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("activity and outbox row committed");
        Ok(CreateActivityRepoOutcome::Created)
    }

    #[instrument(skip(self, input), fields(idempotency_key = %input.idempotency_key))]
    async fn get_by_idempotency_key(
        &self,
        input: GetByIdempotencyKeyRepoInput,
    ) -> DomainResult<Option<Activity>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let cutoff = Utc::now() - input.window;
        let row = conn
            .query_opt(
                "SELECT activity_id, subject_id, kind, payload, occurred_at, recorded_at, idempotency_key
                 FROM activities
                 WHERE idempotency_key = $1 AND recorded_at >= $2",
                &[&input.idempotency_key, &cutoff],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.as_ref().map(row_to_activity).transpose()
    }

    #[instrument(skip(self, input), fields(subject_id = %input.subject_id))]
    async fn list_recent_for_subject(
        &self,
        input: ListRecentForSubjectRepoInput,
    ) -> DomainResult<Vec<Activity>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let limit = input.limit as i64;
        let rows = conn
            .query(
                "SELECT activity_id, subject_id, kind, payload, occurred_at, recorded_at, idempotency_key
                 FROM activities
                 WHERE subject_id = $1
                 ORDER BY recorded_at DESC
                 LIMIT $2",
                &[&input.subject_id, &limit],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        rows.iter().map(row_to_activity).collect()
    }
}
