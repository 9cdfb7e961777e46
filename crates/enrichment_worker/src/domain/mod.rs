mod backoff;
mod enrichment_service;

pub use backoff::BackoffPolicy;
pub use enrichment_service::{EnrichmentConfig, EnrichmentService, EnvelopeDisposition};
