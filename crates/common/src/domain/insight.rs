use crate::domain::activity::ActivityKind;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// AI-derived annotation attached to one or more activities.
///
/// Invariant: for a (subject_id, derivation_key) pair only the highest
/// version is authoritative; older versions are retained for audit but never
/// served as current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub subject_id: String,
    pub derivation_key: String,
    /// Activity ids this insight was derived from. Grows monotonically across
    /// versions of the same derivation key.
    pub derived_from: BTreeSet<String>,
    /// Monotonic per (subject_id, derivation_key).
    pub version: u32,
    pub content: String,
    pub status: InsightStatus,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    Pending,
    Ready,
    Failed,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::Pending => "pending",
            InsightStatus::Ready => "ready",
            InsightStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<InsightStatus> {
        match s {
            "pending" => Some(InsightStatus::Pending),
            "ready" => Some(InsightStatus::Ready),
            "failed" => Some(InsightStatus::Failed),
            _ => None,
        }
    }
}

/// The logical insight slot an activity kind feeds. Mirrors the product's
/// analyzer set: sleep patterns, feeding summaries, care metrics, memory
/// highlights and growth trends.
pub fn derivation_key_for(kind: ActivityKind) -> &'static str {
    match kind {
        ActivityKind::Feeding => "feeding-summary",
        ActivityKind::Sleep => "sleep-pattern",
        ActivityKind::Diaper => "care-metrics",
        ActivityKind::Photo | ActivityKind::Milestone => "memory-highlights",
        ActivityKind::Vital => "growth-trend",
    }
}

#[derive(Debug, Clone)]
pub struct GetLatestInsightRepoInput {
    pub subject_id: String,
    pub derivation_key: String,
}

/// Repository trait for the insight store.
///
/// `upsert` is a compare-and-swap on version: the insert succeeds only if no
/// row for (subject_id, derivation_key) with `version >= insight.version`
/// exists, otherwise `VersionConflict` carrying the current version. The CAS
/// must be atomic at the storage layer, never an in-process lock.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait InsightRepository: Send + Sync {
    async fn upsert(&self, insight: &Insight) -> DomainResult<u32>;

    async fn get_latest(&self, input: GetLatestInsightRepoInput)
        -> DomainResult<Option<Insight>>;
}

/// Side-effecting hook invoked after a Ready insight lands. Best-effort:
/// implementations log failures and must never block or fail the upsert path.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait InsightNotifier: Send + Sync {
    async fn insight_ready(&self, insight: &Insight) -> DomainResult<()>;
}

/// Fans one notification out to every registered subscriber, swallowing
/// individual failures.
pub struct FanoutInsightNotifier {
    subscribers: Vec<std::sync::Arc<dyn InsightNotifier>>,
}

impl FanoutInsightNotifier {
    pub fn new(subscribers: Vec<std::sync::Arc<dyn InsightNotifier>>) -> Self {
        Self { subscribers }
    }
}

#[async_trait]
impl InsightNotifier for FanoutInsightNotifier {
    async fn insight_ready(&self, insight: &Insight) -> DomainResult<()> {
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.insight_ready(insight).await {
                tracing::warn!(
                    subject_id = %insight.subject_id,
                    derivation_key = %insight.derivation_key,
                    error = %e,
                    "insight notification subscriber failed"
                );
            }
        }
        Ok(())
    }
}
