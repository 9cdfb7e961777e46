use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid payload for kind {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    #[error("No insight for subject {subject_id} and derivation key {derivation_key}")]
    InsightNotFound {
        subject_id: String,
        derivation_key: String,
    },

    #[error("Insight version conflict for {derivation_key}: current version is {current_version}")]
    VersionConflict {
        derivation_key: String,
        current_version: u32,
    },

    #[error("Object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Envelope conversion error: {0}")]
    EnvelopeConversionError(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// Caller-fault and not-found errors are final; infrastructure and
    /// storage errors are assumed momentary. `VersionConflict` is neither:
    /// it is an expected concurrency signal the caller resolves itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::StorageUnavailable(_) | DomainError::RepositoryError(_)
        )
    }
}
