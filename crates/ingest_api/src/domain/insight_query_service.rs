use common::domain::{
    DomainError, DomainResult, GetLatestInsightRepoInput, Insight, InsightRepository,
};
use garde::Validate;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Validate)]
pub struct GetLatestInsightInput {
    #[garde(length(min = 1))]
    pub subject_id: String,
    #[garde(length(min = 1))]
    pub derivation_key: String,
}

/// Query boundary over the insight store: serves the highest version only.
pub struct InsightQueryService {
    insight_repository: Arc<dyn InsightRepository>,
}

impl InsightQueryService {
    pub fn new(insight_repository: Arc<dyn InsightRepository>) -> Self {
        Self { insight_repository }
    }

    #[instrument(skip(self, input), fields(subject_id = %input.subject_id, derivation_key = %input.derivation_key))]
    pub async fn get_latest(&self, input: GetLatestInsightInput) -> DomainResult<Insight> {
        common::garde::validate_struct(&input)?;

        self.insight_repository
            .get_latest(GetLatestInsightRepoInput {
                subject_id: input.subject_id.clone(),
                derivation_key: input.derivation_key.clone(),
            })
            .await?
            .ok_or(DomainError::InsightNotFound {
                subject_id: input.subject_id,
                derivation_key: input.derivation_key,
            })
    }
}
