use crate::domain::BackoffPolicy;
use chrono::Utc;
use common::domain::{
    derivation_key_for, ActivityRepository, ClaimOutcome, DomainError, DomainResult, Enricher,
    EnrichmentContext, EnrichmentError, Envelope, GetLatestInsightRepoInput, Insight,
    InsightNotifier, InsightRepository, InsightStatus, ListRecentForSubjectRepoInput,
    ProcessingRecordRepository, TryClaimRepoInput,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Operator-safe content for failed insights; internal error detail stays in
/// logs and the dead-letter record.
const FAILED_INSIGHT_CONTENT: &str =
    "Enrichment could not be completed for this activity.";

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Identifies this process's lease ownership in processing records.
    pub worker_id: String,
    /// Per-call bound on the AI capability; strictly shorter than the lease.
    pub ai_call_timeout: Duration,
    /// How long a claim stays exclusive without completion.
    pub lease_duration: chrono::Duration,
    /// Claims beyond this count dead-letter the envelope.
    pub max_attempts: u32,
    /// Recent-history window handed to the AI capability.
    pub recent_activity_limit: usize,
    pub backoff: BackoffPolicy,
    /// Bound on the version-CAS resolve loop before backing out as transient.
    pub max_cas_retries: u32,
}

impl EnrichmentConfig {
    pub fn for_worker(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ai_call_timeout: Duration::from_secs(30),
            lease_duration: chrono::Duration::seconds(120),
            max_attempts: 3,
            recent_activity_limit: 20,
            backoff: BackoffPolicy::default(),
            max_cas_retries: 3,
        }
    }
}

/// What the consumer should do with the envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeDisposition {
    /// Work is complete (or terminally dead-lettered): acknowledge.
    Completed,
    /// Nothing to do (already done or dead-lettered earlier): acknowledge.
    Skipped,
    /// Transient failure or held lease: negative-ack for redelivery after
    /// `delay`.
    Retry { reason: String, delay: Duration },
}

/// The per-envelope worker loop.
///
/// receive → claim processing record → bounded AI call → versioned insight
/// upsert → mark done → notify. Exactly-once effect on top of at-least-once
/// delivery comes from the claim CAS (Done records ack without recompute) and
/// the version CAS on the insight store (a late, superseded write loses).
pub struct EnrichmentService {
    record_repository: Arc<dyn ProcessingRecordRepository>,
    insight_repository: Arc<dyn InsightRepository>,
    activity_repository: Arc<dyn ActivityRepository>,
    enricher: Arc<dyn Enricher>,
    notifier: Arc<dyn InsightNotifier>,
    /// Admission control for the AI capability, shared across every worker of
    /// one pipeline instance. Explicit constructor state, not a global.
    ai_limiter: Arc<Semaphore>,
    config: EnrichmentConfig,
}

impl EnrichmentService {
    pub fn new(
        record_repository: Arc<dyn ProcessingRecordRepository>,
        insight_repository: Arc<dyn InsightRepository>,
        activity_repository: Arc<dyn ActivityRepository>,
        enricher: Arc<dyn Enricher>,
        notifier: Arc<dyn InsightNotifier>,
        ai_limiter: Arc<Semaphore>,
        config: EnrichmentConfig,
    ) -> DomainResult<Self> {
        let lease = config
            .lease_duration
            .to_std()
            .map_err(|_| DomainError::ValidationError("lease_duration must be positive".into()))?;
        // A lease must always outlive its own AI call attempt.
        if config.ai_call_timeout >= lease {
            return Err(DomainError::ValidationError(format!(
                "ai_call_timeout ({:?}) must be shorter than lease_duration ({lease:?})",
                config.ai_call_timeout
            )));
        }

        Ok(Self {
            record_repository,
            insight_repository,
            activity_repository,
            enricher,
            notifier,
            ai_limiter,
            config,
        })
    }

    #[instrument(skip(self, envelope), fields(activity_id = %envelope.activity.id, partition = %envelope.partition_key, sequence = envelope.sequence))]
    pub async fn process_envelope(&self, envelope: Envelope) -> DomainResult<EnvelopeDisposition> {
        let activity = &envelope.activity;

        let claim = self
            .record_repository
            .try_claim(TryClaimRepoInput {
                activity_id: activity.id.clone(),
                partition_key: envelope.partition_key.clone(),
                sequence: envelope.sequence,
                worker_id: self.config.worker_id.clone(),
                lease_duration: self.config.lease_duration,
            })
            .await?;

        let attempt = match claim {
            ClaimOutcome::AlreadyDone => {
                debug!("envelope already processed, acking without recompute");
                return Ok(EnvelopeDisposition::Skipped);
            }
            ClaimOutcome::DeadLettered => {
                debug!("envelope dead-lettered earlier, acking");
                return Ok(EnvelopeDisposition::Skipped);
            }
            ClaimOutcome::LeaseHeld => {
                return Ok(EnvelopeDisposition::Retry {
                    reason: "lease held by another worker".to_string(),
                    delay: self.config.backoff.delay_for(1),
                });
            }
            ClaimOutcome::Acquired { attempt } => attempt,
        };

        if attempt > self.config.max_attempts {
            warn!(attempt, "retry budget exhausted, dead-lettering");
            return self.dead_letter(&envelope, "retry budget exhausted").await;
        }

        // Admission control: at most N AI calls in flight across the whole
        // pipeline instance; waiting here queues broker-side rather than
        // buffering locally.
        let _permit = self
            .ai_limiter
            .acquire()
            .await
            .map_err(|_| DomainError::RepositoryError(anyhow::anyhow!("ai limiter closed")))?;

        let derivation_key = derivation_key_for(activity.kind()).to_string();
        let context = EnrichmentContext {
            subject_id: activity.subject_id.clone(),
            derivation_key: derivation_key.clone(),
            triggering_activity: activity.clone(),
            recent_activities: self
                .activity_repository
                .list_recent_for_subject(ListRecentForSubjectRepoInput {
                    subject_id: activity.subject_id.clone(),
                    limit: self.config.recent_activity_limit,
                })
                .await?,
        };

        let enrichment = tokio::time::timeout(
            self.config.ai_call_timeout,
            self.enricher.enrich(&context),
        )
        .await;
        drop(_permit);

        let content = match enrichment {
            Err(_) => {
                return self
                    .transient_failure(&envelope, attempt, "ai call timed out")
                    .await
            }
            Ok(Err(EnrichmentError::Transient(reason))) => {
                return self.transient_failure(&envelope, attempt, &reason).await
            }
            Ok(Err(EnrichmentError::Permanent(reason))) => {
                warn!(reason = %reason, "ai capability rejected input, dead-lettering");
                return self.dead_letter(&envelope, &reason).await;
            }
            Ok(Ok(content)) => content,
        };

        self.commit_insight(&envelope, &derivation_key, content, attempt)
            .await
    }

    /// Versioned upsert with the recompute-or-discard conflict policy.
    async fn commit_insight(
        &self,
        envelope: &Envelope,
        derivation_key: &str,
        content: String,
        attempt: u32,
    ) -> DomainResult<EnvelopeDisposition> {
        let activity = &envelope.activity;
        let mut cas_attempts = 0;

        loop {
            let current = self
                .insight_repository
                .get_latest(GetLatestInsightRepoInput {
                    subject_id: activity.subject_id.clone(),
                    derivation_key: derivation_key.to_string(),
                })
                .await?;

            let (current_version, mut derived_from) = match current {
                Some(latest) => {
                    if latest.derived_from.contains(&activity.id) {
                        // A concurrent winner already covers this activity:
                        // discard our result rather than writing a redundant
                        // version.
                        debug!(
                            version = latest.version,
                            "current insight already covers activity, discarding"
                        );
                        self.record_repository
                            .mark_done(&activity.id, &self.config.worker_id)
                            .await?;
                        return Ok(EnvelopeDisposition::Completed);
                    }
                    (latest.version, latest.derived_from)
                }
                None => (0, BTreeSet::new()),
            };

            derived_from.insert(activity.id.clone());

            let insight = Insight {
                id: Uuid::new_v4().to_string(),
                subject_id: activity.subject_id.clone(),
                derivation_key: derivation_key.to_string(),
                derived_from,
                version: current_version + 1,
                content: content.clone(),
                status: InsightStatus::Ready,
                generated_at: Utc::now(),
            };

            match self.insight_repository.upsert(&insight).await {
                Ok(version) => {
                    info!(version, "insight committed");
                    self.record_repository
                        .mark_done(&activity.id, &self.config.worker_id)
                        .await?;

                    // Best-effort: delivery must never fail the upsert path.
                    if let Err(e) = self.notifier.insight_ready(&insight).await {
                        warn!(error = %e, "insight notification failed");
                    }

                    return Ok(EnvelopeDisposition::Completed);
                }
                Err(DomainError::VersionConflict {
                    current_version, ..
                }) => {
                    cas_attempts += 1;
                    debug!(
                        current_version,
                        cas_attempts, "insight version conflict, re-evaluating"
                    );
                    if cas_attempts > self.config.max_cas_retries {
                        return self
                            .transient_failure(envelope, attempt, "version conflict persisted")
                            .await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transient_failure(
        &self,
        envelope: &Envelope,
        attempt: u32,
        reason: &str,
    ) -> DomainResult<EnvelopeDisposition> {
        if attempt >= self.config.max_attempts {
            warn!(attempt, reason = %reason, "final transient failure, dead-lettering");
            return self.dead_letter(envelope, reason).await;
        }

        // Give the lease back so redelivery retries without waiting out the
        // full lease.
        self.record_repository
            .release(&envelope.activity.id, &self.config.worker_id)
            .await?;

        Ok(EnvelopeDisposition::Retry {
            reason: reason.to_string(),
            delay: self.config.backoff.delay_for(attempt),
        })
    }

    /// Terminal failure: record for operators, write a Failed insight so the
    /// caller-visible status resolves, ack the envelope. Never retried.
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        reason: &str,
    ) -> DomainResult<EnvelopeDisposition> {
        let activity = &envelope.activity;
        self.record_repository
            .mark_dead_lettered(&activity.id, &self.config.worker_id, reason)
            .await?;

        let derivation_key = derivation_key_for(activity.kind()).to_string();
        let current_version = self
            .insight_repository
            .get_latest(GetLatestInsightRepoInput {
                subject_id: activity.subject_id.clone(),
                derivation_key: derivation_key.clone(),
            })
            .await?
            .map(|insight| insight.version)
            .unwrap_or(0);

        let failed = Insight {
            id: Uuid::new_v4().to_string(),
            subject_id: activity.subject_id.clone(),
            derivation_key,
            derived_from: BTreeSet::from([activity.id.clone()]),
            version: current_version + 1,
            content: FAILED_INSIGHT_CONTENT.to_string(),
            status: InsightStatus::Failed,
            generated_at: Utc::now(),
        };

        // The failed marker is advisory; a concurrent Ready version winning
        // the slot is fine and not worth fighting over.
        if let Err(e) = self.insight_repository.upsert(&failed).await {
            match e {
                DomainError::VersionConflict { .. } => {
                    debug!("failed-insight write lost a version race, keeping winner");
                }
                other => return Err(other),
            }
        }

        Ok(EnvelopeDisposition::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::domain::{
        Activity, ActivityKind, ActivityPayload, MockActivityRepository, MockEnricher,
        MockInsightNotifier, MockInsightRepository, MockProcessingRecordRepository,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope_for(activity_id: &str, subject_id: &str) -> Envelope {
        Envelope {
            activity: Activity {
                id: activity_id.to_string(),
                subject_id: subject_id.to_string(),
                payload: ActivityPayload::from_kind_and_fields(
                    ActivityKind::Sleep,
                    json!({"duration_min": 45}),
                )
                .unwrap(),
                occurred_at: Utc::now(),
                recorded_at: Utc::now(),
                idempotency_key: format!("key-{activity_id}"),
            },
            partition_key: subject_id.to_string(),
            sequence: 1,
            published_at: Utc::now(),
        }
    }

    fn test_config() -> EnrichmentConfig {
        EnrichmentConfig {
            worker_id: "worker-1".to_string(),
            ai_call_timeout: Duration::from_millis(100),
            lease_duration: chrono::Duration::seconds(5),
            max_attempts: 3,
            recent_activity_limit: 10,
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(80),
            },
            max_cas_retries: 3,
        }
    }

    struct Mocks {
        records: MockProcessingRecordRepository,
        insights: MockInsightRepository,
        activities: MockActivityRepository,
        enricher: MockEnricher,
        notifier: MockInsightNotifier,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                records: MockProcessingRecordRepository::new(),
                insights: MockInsightRepository::new(),
                activities: MockActivityRepository::new(),
                enricher: MockEnricher::new(),
                notifier: MockInsightNotifier::new(),
            }
        }

        fn with_empty_history(mut self) -> Self {
            self.activities
                .expect_list_recent_for_subject()
                .returning(|_| Ok(vec![]));
            self
        }

        fn into_service(self, permits: usize) -> EnrichmentService {
            EnrichmentService::new(
                Arc::new(self.records),
                Arc::new(self.insights),
                Arc::new(self.activities),
                Arc::new(self.enricher),
                Arc::new(self.notifier),
                Arc::new(Semaphore::new(permits)),
                test_config(),
            )
            .unwrap()
        }
    }

    fn ready_insight(subject: &str, version: u32, derived: &[&str]) -> Insight {
        Insight {
            id: format!("ins-{version}"),
            subject_id: subject.to_string(),
            derivation_key: "sleep-pattern".to_string(),
            derived_from: derived.iter().map(|s| s.to_string()).collect(),
            version,
            content: "existing".to_string(),
            status: InsightStatus::Ready,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_success_writes_first_version_and_marks_done() {
        // Arrange
        let mut mocks = Mocks::new().with_empty_history();

        mocks
            .records
            .expect_try_claim()
            .withf(|input: &TryClaimRepoInput| {
                input.activity_id == "act-1" && input.worker_id == "worker-1"
            })
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        mocks
            .records
            .expect_mark_done()
            .withf(|activity_id: &str, worker_id: &str| {
                activity_id == "act-1" && worker_id == "worker-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        mocks
            .enricher
            .expect_enrich()
            .withf(|ctx: &EnrichmentContext| {
                ctx.subject_id == "child-1" && ctx.derivation_key == "sleep-pattern"
            })
            .times(1)
            .returning(|_| Ok("naps are consolidating".to_string()));

        mocks.insights.expect_get_latest().times(1).returning(|_| Ok(None));
        mocks
            .insights
            .expect_upsert()
            .withf(|insight: &Insight| {
                insight.version == 1
                    && insight.status == InsightStatus::Ready
                    && insight.derived_from.contains("act-1")
            })
            .times(1)
            .returning(|insight| Ok(insight.version));

        mocks
            .notifier
            .expect_insight_ready()
            .times(1)
            .returning(|_| Ok(()));

        let service = mocks.into_service(4);

        // Act
        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        // Assert
        assert_eq!(disposition, EnvelopeDisposition::Completed);
    }

    #[tokio::test]
    async fn test_redelivered_done_envelope_acks_without_ai_call() {
        let mut mocks = Mocks::new();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::AlreadyDone));
        // The AI capability must not be invoked for an already-Done envelope.
        mocks.enricher.expect_enrich().times(0);
        mocks.insights.expect_upsert().times(0);

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        assert_eq!(disposition, EnvelopeDisposition::Skipped);
    }

    #[tokio::test]
    async fn test_live_lease_held_by_other_worker_defers() {
        let mut mocks = Mocks::new();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::LeaseHeld));
        mocks.enricher.expect_enrich().times(0);

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        assert!(matches!(disposition, EnvelopeDisposition::Retry { .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_releases_lease_with_backoff() {
        let mut mocks = Mocks::new().with_empty_history();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        mocks
            .records
            .expect_release()
            .withf(|activity_id: &str, worker_id: &str| {
                activity_id == "act-1" && worker_id == "worker-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        mocks
            .enricher
            .expect_enrich()
            .times(1)
            .returning(|_| Err(EnrichmentError::Transient("rate limited".to_string())));

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        match disposition {
            EnvelopeDisposition::Retry { reason, delay } => {
                assert!(reason.contains("rate limited"));
                assert_eq!(delay, Duration::from_millis(10));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    struct StalledEnricher;

    #[async_trait]
    impl Enricher for StalledEnricher {
        async fn enrich(&self, _context: &EnrichmentContext) -> Result<String, EnrichmentError> {
            // Outlives the 100ms call timeout.
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn test_ai_timeout_is_transient() {
        let mut records = MockProcessingRecordRepository::new();
        records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        records.expect_release().times(1).returning(|_, _| Ok(()));

        let mut activities = MockActivityRepository::new();
        activities
            .expect_list_recent_for_subject()
            .returning(|_| Ok(vec![]));

        let service = EnrichmentService::new(
            Arc::new(records),
            Arc::new(MockInsightRepository::new()),
            Arc::new(activities),
            Arc::new(StalledEnricher),
            Arc::new(MockInsightNotifier::new()),
            Arc::new(Semaphore::new(1)),
            test_config(),
        )
        .unwrap();

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        match disposition {
            EnvelopeDisposition::Retry { reason, .. } => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_twice_then_succeed_yields_single_ready_version() {
        // Scenario: two transient attempts, success on the third, within the
        // retry bound of 3. Exactly one insight version is written.
        let upserts = Arc::new(AtomicUsize::new(0));
        let upsert_count = upserts.clone();

        let mut mocks = Mocks::new().with_empty_history();

        let claim_no = Arc::new(AtomicUsize::new(0));
        mocks.records.expect_try_claim().times(3).returning(move |_| {
            let attempt = claim_no.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            Ok(ClaimOutcome::Acquired { attempt })
        });
        mocks
            .records
            .expect_release()
            .times(2)
            .returning(|_, _| Ok(()));
        mocks
            .records
            .expect_mark_done()
            .times(1)
            .returning(|_, _| Ok(()));

        let call_no = Arc::new(AtomicUsize::new(0));
        mocks.enricher.expect_enrich().times(3).returning(move |_| {
            if call_no.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EnrichmentError::Transient("timeout".to_string()))
            } else {
                Ok("sleep is settling into a rhythm".to_string())
            }
        });

        mocks.insights.expect_get_latest().times(1).returning(|_| Ok(None));
        mocks
            .insights
            .expect_upsert()
            .withf(|insight: &Insight| {
                insight.version == 1 && insight.status == InsightStatus::Ready
            })
            .times(1)
            .returning(move |insight| {
                upsert_count.fetch_add(1, Ordering::SeqCst);
                Ok(insight.version)
            });

        mocks
            .notifier
            .expect_insight_ready()
            .times(1)
            .returning(|_| Ok(()));

        let service = mocks.into_service(4);
        let envelope = envelope_for("act-1", "child-1");

        // First two deliveries fail transiently, the redelivery succeeds.
        for expected_retry in [true, true, false] {
            let disposition = service.process_envelope(envelope.clone()).await.unwrap();
            if expected_retry {
                assert!(matches!(disposition, EnvelopeDisposition::Retry { .. }));
            } else {
                assert_eq!(disposition, EnvelopeDisposition::Completed);
            }
        }

        assert_eq!(upserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_dead_letters_with_sanitized_insight() {
        let mut mocks = Mocks::new().with_empty_history();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        mocks
            .records
            .expect_mark_dead_lettered()
            .withf(|activity_id: &str, _worker: &str, reason: &str| {
                activity_id == "act-1" && reason.contains("unsupported payload")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        mocks.enricher.expect_enrich().times(1).returning(|_| {
            Err(EnrichmentError::Permanent(
                "unsupported payload shape".to_string(),
            ))
        });

        mocks.insights.expect_get_latest().times(1).returning(|_| Ok(None));
        // The failed insight must not leak the internal rejection reason.
        mocks
            .insights
            .expect_upsert()
            .withf(|insight: &Insight| {
                insight.status == InsightStatus::Failed
                    && !insight.content.contains("unsupported payload")
            })
            .times(1)
            .returning(|insight| Ok(insight.version));

        // No Ready notification for failures.
        mocks.notifier.expect_insight_ready().times(0);

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        assert_eq!(disposition, EnvelopeDisposition::Completed);
    }

    #[tokio::test]
    async fn test_dead_lettered_envelope_never_retries() {
        let mut mocks = Mocks::new();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::DeadLettered));
        mocks.enricher.expect_enrich().times(0);

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        assert_eq!(disposition, EnvelopeDisposition::Skipped);
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_dead_letters_without_ai_call() {
        let mut mocks = Mocks::new().with_empty_history();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 4 }));
        mocks
            .records
            .expect_mark_dead_lettered()
            .times(1)
            .returning(|_, _, _| Ok(()));
        mocks.enricher.expect_enrich().times(0);

        mocks.insights.expect_get_latest().times(1).returning(|_| Ok(None));
        mocks
            .insights
            .expect_upsert()
            .withf(|insight: &Insight| insight.status == InsightStatus::Failed)
            .times(1)
            .returning(|insight| Ok(insight.version));

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        assert_eq!(disposition, EnvelopeDisposition::Completed);
    }

    #[tokio::test]
    async fn test_version_conflict_discards_when_winner_covers_activity() {
        let mut mocks = Mocks::new().with_empty_history();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        mocks
            .records
            .expect_mark_done()
            .times(1)
            .returning(|_, _| Ok(()));

        mocks
            .enricher
            .expect_enrich()
            .times(1)
            .returning(|_| Ok("fresh".to_string()));

        let reads = Arc::new(AtomicUsize::new(0));
        let read_no = reads.clone();
        mocks.insights.expect_get_latest().times(2).returning(move |_| {
            if read_no.fetch_add(1, Ordering::SeqCst) == 0 {
                // First read: version 1 that does not cover our activity.
                Ok(Some(ready_insight("child-1", 1, &["act-0"])))
            } else {
                // After the conflict: the winner already covers act-1.
                Ok(Some(ready_insight("child-1", 2, &["act-0", "act-1"])))
            }
        });

        mocks
            .insights
            .expect_upsert()
            .withf(|insight: &Insight| insight.version == 2)
            .times(1)
            .returning(|_| {
                Err(DomainError::VersionConflict {
                    derivation_key: "sleep-pattern".to_string(),
                    current_version: 2,
                })
            });

        mocks.notifier.expect_insight_ready().times(0);

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        // The loser discards and the record still resolves to Done.
        assert_eq!(disposition, EnvelopeDisposition::Completed);
    }

    #[tokio::test]
    async fn test_version_conflict_merges_and_retries_cas() {
        let mut mocks = Mocks::new().with_empty_history();

        mocks
            .records
            .expect_try_claim()
            .times(1)
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        mocks
            .records
            .expect_mark_done()
            .times(1)
            .returning(|_, _| Ok(()));

        mocks
            .enricher
            .expect_enrich()
            .times(1)
            .returning(|_| Ok("fresh".to_string()));

        let reads = Arc::new(AtomicUsize::new(0));
        let read_no = reads.clone();
        mocks.insights.expect_get_latest().times(2).returning(move |_| {
            if read_no.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                // A concurrent writer landed version 1 from another activity.
                Ok(Some(ready_insight("child-1", 1, &["act-9"])))
            }
        });

        let upserts = Arc::new(AtomicUsize::new(0));
        let upsert_no = upserts.clone();
        mocks.insights.expect_upsert().times(2).returning(move |insight| {
            if upsert_no.fetch_add(1, Ordering::SeqCst) == 0 {
                assert_eq!(insight.version, 1);
                Err(DomainError::VersionConflict {
                    derivation_key: "sleep-pattern".to_string(),
                    current_version: 1,
                })
            } else {
                // Recompute: derived coverage grew to include both lineages.
                assert_eq!(insight.version, 2);
                assert!(insight.derived_from.contains("act-1"));
                assert!(insight.derived_from.contains("act-9"));
                Ok(insight.version)
            }
        });

        mocks
            .notifier
            .expect_insight_ready()
            .times(1)
            .returning(|_| Ok(()));

        let service = mocks.into_service(4);

        let disposition = service
            .process_envelope(envelope_for("act-1", "child-1"))
            .await
            .unwrap();

        assert_eq!(disposition, EnvelopeDisposition::Completed);
    }

    struct GaugedEnricher {
        in_flight: AtomicUsize,
        max_observed: AtomicUsize,
    }

    #[async_trait]
    impl Enricher for GaugedEnricher {
        async fn enrich(&self, _context: &EnrichmentContext) -> Result<String, EnrichmentError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("bounded".to_string())
        }
    }

    #[tokio::test]
    async fn test_semaphore_bounds_in_flight_ai_calls() {
        // Burst of 6 envelopes through one context with 2 permits: the gauge
        // must never exceed 2.
        let enricher = Arc::new(GaugedEnricher {
            in_flight: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
        });

        let mut records = MockProcessingRecordRepository::new();
        records
            .expect_try_claim()
            .returning(|_| Ok(ClaimOutcome::Acquired { attempt: 1 }));
        records.expect_mark_done().returning(|_, _| Ok(()));

        let mut insights = MockInsightRepository::new();
        insights.expect_get_latest().returning(|_| Ok(None));
        insights.expect_upsert().returning(|insight| Ok(insight.version));

        let mut activities = MockActivityRepository::new();
        activities
            .expect_list_recent_for_subject()
            .returning(|_| Ok(vec![]));

        let mut notifier = MockInsightNotifier::new();
        notifier.expect_insight_ready().returning(|_| Ok(()));

        let service = Arc::new(
            EnrichmentService::new(
                Arc::new(records),
                Arc::new(insights),
                Arc::new(activities),
                enricher.clone(),
                Arc::new(notifier),
                Arc::new(Semaphore::new(2)),
                test_config(),
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..6 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                // Distinct subjects so version CAS never interferes.
                service
                    .process_envelope(envelope_for(
                        &format!("act-{i}"),
                        &format!("child-{i}"),
                    ))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), EnvelopeDisposition::Completed);
        }

        assert!(enricher.max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_config_rejects_ai_timeout_not_shorter_than_lease() {
        let mut config = test_config();
        config.ai_call_timeout = Duration::from_secs(10);
        config.lease_duration = chrono::Duration::seconds(5);

        let result = EnrichmentService::new(
            Arc::new(MockProcessingRecordRepository::new()),
            Arc::new(MockInsightRepository::new()),
            Arc::new(MockActivityRepository::new()),
            Arc::new(MockEnricher::new()),
            Arc::new(MockInsightNotifier::new()),
            Arc::new(Semaphore::new(1)),
            config,
        );

        assert!(matches!(result, Err(DomainError::ValidationError(_))));
    }
}
