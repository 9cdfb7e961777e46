use crate::domain::activity::Activity;
use async_trait::async_trait;
use thiserror::Error;

/// Context handed to the AI capability for one enrichment: the activity that
/// triggered the work plus a recent-history window for the same subject.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentContext {
    pub subject_id: String,
    pub derivation_key: String,
    pub triggering_activity: Activity,
    /// Recent activities for the subject, newest first.
    pub recent_activities: Vec<Activity>,
}

/// Classified failure of the AI capability. The split drives retry policy:
/// transient failures are retried with backoff up to a bound, permanent
/// rejections are dead-lettered immediately.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    /// Timeout, rate limit, 5xx-equivalent. Worth retrying.
    #[error("transient enrichment failure: {0}")]
    Transient(String),

    /// The capability deterministically rejects this input. Retrying cannot
    /// help.
    #[error("enrichment rejected: {0}")]
    Permanent(String),
}

/// The AI capability: an opaque `Enrich(context) -> Insight | Error` seam.
/// Treated as a scarce, possibly rate-limited external resource; callers
/// bound concurrency and wrap calls in their own timeout.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, context: &EnrichmentContext) -> Result<String, EnrichmentError>;
}
