mod activity;
mod enricher;
mod envelope;
mod insight;
mod outbox;
mod photo_store;
mod processing_record;
mod result;

pub use activity::{
    Activity, ActivityKind, ActivityPayload, ActivityRepository, CreateActivityRepoInput,
    CreateActivityRepoOutcome, DiaperCondition, FeedingType, GetByIdempotencyKeyRepoInput,
    ListRecentForSubjectRepoInput, VitalMeasurement,
};
pub use enricher::{Enricher, EnrichmentContext, EnrichmentError};
pub use envelope::{partition_for, Envelope, EnvelopePublisher};
pub use insight::{
    derivation_key_for, FanoutInsightNotifier, GetLatestInsightRepoInput, Insight,
    InsightNotifier, InsightRepository, InsightStatus,
};
pub use outbox::{FetchUnpublishedRepoInput, OutboxEntry, OutboxRepository};
pub use processing_record::{
    ClaimOutcome, ProcessingRecord, ProcessingRecordRepository, ProcessingState,
    TryClaimRepoInput,
};
pub use result::{DomainError, DomainResult};

#[cfg(any(test, feature = "testing"))]
pub use activity::MockActivityRepository;
#[cfg(any(test, feature = "testing"))]
pub use enricher::MockEnricher;
#[cfg(any(test, feature = "testing"))]
pub use envelope::MockEnvelopePublisher;
#[cfg(any(test, feature = "testing"))]
pub use insight::{MockInsightNotifier, MockInsightRepository};
#[cfg(any(test, feature = "testing"))]
pub use outbox::MockOutboxRepository;
#[cfg(any(test, feature = "testing"))]
pub use photo_store::MockPhotoStore;
#[cfg(any(test, feature = "testing"))]
pub use processing_record::MockProcessingRecordRepository;

pub use photo_store::PhotoStore;
