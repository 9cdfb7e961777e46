use crate::domain::{DomainError, DomainResult, Insight, InsightNotifier};
use crate::nats::CorePublisher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Pushes completed insights to subscribers over core NATS.
///
/// Subjects are `{prefix}.{subject_id}`, so a dashboard session subscribes to
/// exactly the children it displays. Fire-and-forget: no stream ack, and a
/// publish failure is the caller's to log, never to act on.
pub struct NatsInsightNotifier {
    publisher: Arc<dyn CorePublisher>,
    subject_prefix: String,
}

impl NatsInsightNotifier {
    pub fn new(publisher: Arc<dyn CorePublisher>, subject_prefix: impl Into<String>) -> Self {
        Self {
            publisher,
            subject_prefix: subject_prefix.into(),
        }
    }
}

#[async_trait]
impl InsightNotifier for NatsInsightNotifier {
    async fn insight_ready(&self, insight: &Insight) -> DomainResult<()> {
        let payload = serde_json::to_vec(insight)
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("insight encode: {e}")))?;
        let subject = format!("{}.{}", self.subject_prefix, insight.subject_id);

        self.publisher
            .publish(subject.clone(), payload.into())
            .await
            .map_err(DomainError::RepositoryError)?;

        debug!(subject = %subject, "insight notification published");
        Ok(())
    }
}
