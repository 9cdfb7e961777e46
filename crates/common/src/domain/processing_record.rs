use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Per-activity processing state supporting exactly-once effect on top of
/// at-least-once delivery.
///
/// Lifecycle: created on first consumer pickup, `NotStarted → InFlight →
/// Done | DeadLettered`; a lapsed lease allows `InFlight → InFlight` under a
/// new worker, and a failed attempt releases back to `NotStarted`. Records
/// are never deleted by the pipeline (retention is operational).
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    pub activity_id: String,
    pub partition_key: String,
    pub sequence: u64,
    pub state: ProcessingState,
    /// Number of claims taken so far; bounds retries.
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingState {
    NotStarted,
    InFlight {
        worker_id: String,
        lease_expires_at: DateTime<Utc>,
    },
    Done,
    DeadLettered {
        reason: String,
    },
}

impl ProcessingState {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingState::NotStarted => "not_started",
            ProcessingState::InFlight { .. } => "in_flight",
            ProcessingState::Done => "done",
            ProcessingState::DeadLettered { .. } => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TryClaimRepoInput {
    pub activity_id: String,
    pub partition_key: String,
    pub sequence: u64,
    pub worker_id: String,
    pub lease_duration: Duration,
}

/// Outcome of a claim attempt. All transitions are compare-and-set at the
/// storage layer so two workers observing the same envelope cannot both
/// acquire.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Lease acquired; `attempt` counts this claim (1-based).
    Acquired { attempt: u32 },
    AlreadyDone,
    /// A live lease is held by another worker; the envelope will be
    /// redelivered after lease expiry.
    LeaseHeld,
    DeadLettered,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProcessingRecordRepository: Send + Sync {
    /// Create-or-claim the record for an envelope. Steals expired leases.
    async fn try_claim(&self, input: TryClaimRepoInput) -> DomainResult<ClaimOutcome>;

    /// Transition to Done. Only honored while `worker_id` holds the lease;
    /// a late call from a superseded worker is a no-op.
    async fn mark_done(&self, activity_id: &str, worker_id: &str) -> DomainResult<()>;

    /// Terminal failure: never retried automatically, surfaced to operators.
    async fn mark_dead_lettered(
        &self,
        activity_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> DomainResult<()>;

    /// Give the lease back after a failed attempt so redelivery can retry
    /// without waiting for expiry. Keeps the attempt count.
    async fn release(&self, activity_id: &str, worker_id: &str) -> DomainResult<()>;
}
