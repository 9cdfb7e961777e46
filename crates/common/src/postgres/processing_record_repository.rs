use crate::domain::{
    ClaimOutcome, DomainError, DomainResult, ProcessingRecordRepository, TryClaimRepoInput,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};

/// PostgreSQL implementation of `ProcessingRecordRepository`.
///
/// All transitions are single-statement compare-and-set: the claim is an
/// upsert whose UPDATE arm only fires for `not_started` rows or lapsed
/// leases, and the terminal transitions are UPDATEs guarded by the holding
/// worker id. No advisory locks.
#[derive(Clone)]
pub struct PostgresProcessingRecordRepository {
    client: PostgresClient,
}

impl PostgresProcessingRecordRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProcessingRecordRepository for PostgresProcessingRecordRepository {
    #[instrument(skip(self, input), fields(activity_id = %input.activity_id, worker_id = %input.worker_id))]
    async fn try_claim(&self, input: TryClaimRepoInput) -> DomainResult<ClaimOutcome> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let now = Utc::now();
        let lease_expires_at = now + input.lease_duration;
        let sequence = input.sequence as i64;

        let row = conn
            .query_opt(
                "INSERT INTO processing_records
                     (activity_id, partition_key, sequence, state, worker_id, lease_expires_at, attempt, updated_at)
                 VALUES ($1, $2, $3, 'in_flight', $4, $5, 1, $6)
                 ON CONFLICT (activity_id) DO UPDATE
                     SET state = 'in_flight',
                         worker_id = $4,
                         lease_expires_at = $5,
                         attempt = processing_records.attempt + 1,
                         updated_at = $6
                     WHERE processing_records.state = 'not_started'
                        OR (processing_records.state = 'in_flight'
                            AND processing_records.lease_expires_at <= $6)
                 RETURNING attempt",
                &[
                    &input.activity_id,
                    &input.partition_key,
                    &sequence,
                    &input.worker_id,
                    &lease_expires_at,
                    &now,
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if let Some(row) = row {
            let attempt = row.get::<_, i32>("attempt") as u32;
            debug!(attempt, "lease acquired");
            return Ok(ClaimOutcome::Acquired { attempt });
        }

        // The upsert touched nothing: the record exists in a state the claim
        // cannot take. Classify it.
        let row = conn
            .query_opt(
                "SELECT state FROM processing_records WHERE activity_id = $1",
                &[&input.activity_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        match row.map(|r| r.get::<_, String>("state")) {
            Some(state) if state == "done" => Ok(ClaimOutcome::AlreadyDone),
            Some(state) if state == "dead_lettered" => Ok(ClaimOutcome::DeadLettered),
            Some(_) => Ok(ClaimOutcome::LeaseHeld),
            // The row vanished between statements; records are never deleted,
            // so treat as a held lease and let redelivery retry.
            None => {
                warn!("processing record disappeared during claim");
                Ok(ClaimOutcome::LeaseHeld)
            }
        }
    }

    #[instrument(skip(self))]
    async fn mark_done(&self, activity_id: &str, worker_id: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let updated = conn
            .execute(
                "UPDATE processing_records
                 SET state = 'done', lease_expires_at = NULL, updated_at = $3
                 WHERE activity_id = $1 AND worker_id = $2 AND state = 'in_flight'",
                &[&activity_id, &worker_id, &Utc::now()],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if updated == 0 {
            // Lease was lost (stolen after expiry) — the superseding worker
            // owns the outcome now.
            warn!(activity_id, worker_id, "mark_done ignored: lease no longer held");
        }
        Ok(())
    }

    #[instrument(skip(self, reason))]
    async fn mark_dead_lettered(
        &self,
        activity_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let updated = conn
            .execute(
                "UPDATE processing_records
                 SET state = 'dead_lettered', dead_letter_reason = $3,
                     lease_expires_at = NULL, updated_at = $4
                 WHERE activity_id = $1 AND worker_id = $2 AND state = 'in_flight'",
                &[&activity_id, &worker_id, &reason, &Utc::now()],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if updated == 0 {
            warn!(
                activity_id,
                worker_id, "mark_dead_lettered ignored: lease no longer held"
            );
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release(&self, activity_id: &str, worker_id: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "UPDATE processing_records
             SET state = 'not_started', worker_id = NULL,
                 lease_expires_at = NULL, updated_at = $3
             WHERE activity_id = $1 AND worker_id = $2 AND state = 'in_flight'",
            &[&activity_id, &worker_id, &Utc::now()],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }
}
