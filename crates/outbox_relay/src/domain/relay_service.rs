use chrono::Utc;
use common::domain::{
    DomainResult, Envelope, EnvelopePublisher, FetchUnpublishedRepoInput, OutboxRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: usize,
    /// Idle wait between polls when the outbox is drained.
    pub poll_interval: Duration,
    /// Wait before retrying after a broker or store failure.
    pub retry_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Publishes committed outbox rows to the event log and marks them published.
///
/// This is the second half of the outbox pattern: the ingest transaction made
/// the publish intent durable, and this loop makes it real, retrying on
/// broker unavailability. Rows are relayed in id order and a batch stops at
/// the first failure, so sequences within a partition reach the broker in
/// non-decreasing order. Marking can lag publishing (crash between the two),
/// which is exactly the at-least-once the consumer side dedups.
pub struct OutboxRelayService {
    outbox_repository: Arc<dyn OutboxRepository>,
    envelope_publisher: Arc<dyn EnvelopePublisher>,
    config: RelayConfig,
}

impl OutboxRelayService {
    pub fn new(
        outbox_repository: Arc<dyn OutboxRepository>,
        envelope_publisher: Arc<dyn EnvelopePublisher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            outbox_repository,
            envelope_publisher,
            config,
        }
    }

    /// Relay one batch. Returns the number of rows published and marked.
    #[instrument(skip(self))]
    pub async fn relay_batch(&self) -> DomainResult<usize> {
        let entries = self
            .outbox_repository
            .fetch_unpublished(FetchUnpublishedRepoInput {
                limit: self.config.batch_size,
            })
            .await?;

        if entries.is_empty() {
            return Ok(0);
        }

        debug!(count = entries.len(), "relaying outbox batch");

        let mut published_ids = Vec::with_capacity(entries.len());
        let mut first_error = None;

        for entry in entries {
            let envelope = Envelope {
                partition_key: entry.partition_key.clone(),
                sequence: entry.id,
                published_at: Utc::now(),
                activity: entry.activity,
            };

            match self.envelope_publisher.publish_envelope(&envelope).await {
                Ok(()) => published_ids.push(entry.id),
                Err(e) => {
                    // Stop here: relaying later rows first would reorder the
                    // partition's sequence on the broker.
                    warn!(outbox_id = entry.id, error = %e, "publish failed, stopping batch");
                    first_error = Some(e);
                    break;
                }
            }
        }

        let published = published_ids.len();
        if !published_ids.is_empty() {
            self.outbox_repository.mark_published(&published_ids).await?;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }

    /// Poll-and-relay until cancellation.
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!("starting outbox relay");

        loop {
            if ctx.is_cancelled() {
                break;
            }

            let wait = match self.relay_batch().await {
                Ok(0) => self.config.poll_interval,
                Ok(count) => {
                    debug!(count, "relayed outbox rows");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "outbox relay error, backing off");
                    self.config.retry_delay
                }
            };

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("outbox relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::domain::{
        Activity, ActivityKind, ActivityPayload, DomainError, MockEnvelopePublisher,
        MockOutboxRepository, OutboxEntry,
    };
    use mockall::Sequence;
    use serde_json::json;

    fn entry(id: u64, subject: &str) -> OutboxEntry {
        OutboxEntry {
            id,
            partition_key: subject.to_string(),
            activity: Activity {
                id: format!("act-{id}"),
                subject_id: subject.to_string(),
                payload: ActivityPayload::from_kind_and_fields(
                    ActivityKind::Diaper,
                    json!({"condition": "wet"}),
                )
                .unwrap(),
                occurred_at: Utc::now(),
                recorded_at: Utc::now(),
                idempotency_key: format!("key-{id}"),
            },
            created_at: Utc::now(),
            published_at: None,
        }
    }

    #[tokio::test]
    async fn test_relay_publishes_in_order_and_marks() {
        let mut outbox = MockOutboxRepository::new();
        outbox
            .expect_fetch_unpublished()
            .times(1)
            .returning(|_| Ok(vec![entry(1, "child-1"), entry(2, "child-1")]));
        outbox
            .expect_mark_published()
            .withf(|ids: &[u64]| ids == [1, 2])
            .times(1)
            .returning(|_| Ok(()));

        let mut publisher = MockEnvelopePublisher::new();
        let mut seq = Sequence::new();
        publisher
            .expect_publish_envelope()
            .withf(|envelope: &Envelope| envelope.sequence == 1)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        publisher
            .expect_publish_envelope()
            .withf(|envelope: &Envelope| envelope.sequence == 2)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let service = OutboxRelayService::new(
            Arc::new(outbox),
            Arc::new(publisher),
            RelayConfig::default(),
        );

        assert_eq!(service.relay_batch().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_relay_stops_batch_at_first_failure() {
        let mut outbox = MockOutboxRepository::new();
        outbox
            .expect_fetch_unpublished()
            .times(1)
            .returning(|_| Ok(vec![entry(1, "child-1"), entry(2, "child-1"), entry(3, "child-1")]));
        // Only the successful prefix is marked; rows 2 and 3 stay unpublished
        // for the next pass.
        outbox
            .expect_mark_published()
            .withf(|ids: &[u64]| ids == [1])
            .times(1)
            .returning(|_| Ok(()));

        let mut publisher = MockEnvelopePublisher::new();
        publisher
            .expect_publish_envelope()
            .withf(|envelope: &Envelope| envelope.sequence == 1)
            .times(1)
            .returning(|_| Ok(()));
        publisher
            .expect_publish_envelope()
            .withf(|envelope: &Envelope| envelope.sequence == 2)
            .times(1)
            .returning(|_| {
                Err(DomainError::RepositoryError(anyhow::anyhow!(
                    "broker unavailable"
                )))
            });

        let service = OutboxRelayService::new(
            Arc::new(outbox),
            Arc::new(publisher),
            RelayConfig::default(),
        );

        let result = service.relay_batch().await;
        assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    }

    #[tokio::test]
    async fn test_relay_empty_outbox_is_noop() {
        let mut outbox = MockOutboxRepository::new();
        outbox
            .expect_fetch_unpublished()
            .times(1)
            .returning(|_| Ok(vec![]));
        outbox.expect_mark_published().times(0);

        let publisher = MockEnvelopePublisher::new();

        let service = OutboxRelayService::new(
            Arc::new(outbox),
            Arc::new(publisher),
            RelayConfig::default(),
        );

        assert_eq!(service.relay_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_published_failure_surfaces() {
        // Rows were published but marking failed: the error propagates and the
        // rows will be republished — at-least-once, deduped downstream.
        let mut outbox = MockOutboxRepository::new();
        outbox
            .expect_fetch_unpublished()
            .times(1)
            .returning(|_| Ok(vec![entry(1, "child-1")]));
        outbox.expect_mark_published().times(1).returning(|_| {
            Err(DomainError::RepositoryError(anyhow::anyhow!(
                "store unavailable"
            )))
        });

        let mut publisher = MockEnvelopePublisher::new();
        publisher
            .expect_publish_envelope()
            .times(1)
            .returning(|_| Ok(()));

        let service = OutboxRelayService::new(
            Arc::new(outbox),
            Arc::new(publisher),
            RelayConfig::default(),
        );

        assert!(service.relay_batch().await.is_err());
    }
}
