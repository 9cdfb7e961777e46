use crate::domain::activity::Activity;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// The unit placed on the event log: one activity snapshot plus routing and
/// ordering metadata.
///
/// Invariant: envelopes sharing a `partition_key` are delivered to consumers
/// in non-decreasing `sequence` order; across partitions there is no ordering
/// guarantee.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub activity: Activity,
    /// Equals the activity's subject id, so all events for one child serialize
    /// through one partition.
    pub partition_key: String,
    /// Monotonic within a partition (the outbox row id).
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
}

/// Partition bucket for a subject: stable across processes and restarts.
pub fn partition_for(partition_key: &str, partition_count: u32) -> u32 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partition_count.max(1))) as u32
}

/// Trait for publishing envelopes to the event log.
///
/// Implementations serialize to the wire format, publish to the broker subject
/// for the envelope's partition, and await the broker's ack.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish_envelope(&self, envelope: &Envelope) -> DomainResult<()>;
}
