use chrono::{DateTime, Utc};
use common::auth::CredentialVerifier;
use common::domain::{
    Activity, ActivityKind, ActivityPayload, ActivityRepository, CreateActivityRepoInput,
    CreateActivityRepoOutcome, DomainError, DomainResult, GetByIdempotencyKeyRepoInput,
    PhotoStore,
};
use garde::Validate;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Input for submitting one care activity.
#[derive(Debug, Clone, Validate)]
pub struct SubmitActivityInput {
    /// Opaque credential from the external identity provider.
    #[garde(length(min = 1))]
    pub bearer_token: String,
    #[garde(length(min = 1))]
    pub subject_id: String,
    #[garde(skip)]
    pub kind: ActivityKind,
    /// Kind-specific fields (without the kind tag).
    #[garde(skip)]
    pub payload: serde_json::Value,
    #[garde(skip)]
    pub occurred_at: DateTime<Utc>,
    /// Optional; server-derived when absent.
    #[garde(inner(length(min = 1)))]
    pub idempotency_key: Option<String>,
    /// Binary photo content, required for `kind = Photo`.
    #[garde(skip)]
    pub photo: Option<bytes::Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitActivityOutcome {
    pub activity_id: String,
    /// `false` means the idempotency key matched an existing activity: the
    /// existing id is returned and nothing new was persisted or published.
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Matches within this window collapse to one logical activity.
    pub dedup_window: chrono::Duration,
    /// End-to-end bound on the submit path (object store + transaction).
    pub submit_timeout: std::time::Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            dedup_window: chrono::Duration::days(30),
            submit_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// Domain service for the ingest boundary.
///
/// Flow:
/// 1. Verify the bearer credential (delegated, surfaced synchronously)
/// 2. Validate input shape and the payload union against the kind
/// 3. Dedup on the idempotency key within the window
/// 4. For photos, upload the binary first and embed only the content key
/// 5. Persist activity + outbox row in one transaction
pub struct ActivityIngestionService {
    credential_verifier: Arc<dyn CredentialVerifier>,
    activity_repository: Arc<dyn ActivityRepository>,
    photo_store: Arc<dyn PhotoStore>,
    config: IngestionConfig,
    /// Last issued ingestion timestamp; keeps `recorded_at` non-decreasing
    /// within this process.
    last_recorded_at: Mutex<DateTime<Utc>>,
}

impl ActivityIngestionService {
    pub fn new(
        credential_verifier: Arc<dyn CredentialVerifier>,
        activity_repository: Arc<dyn ActivityRepository>,
        photo_store: Arc<dyn PhotoStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            credential_verifier,
            activity_repository,
            photo_store,
            config,
            last_recorded_at: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    #[instrument(skip(self, input), fields(subject_id = %input.subject_id, kind = %input.kind.as_str()))]
    pub async fn submit(&self, input: SubmitActivityInput) -> DomainResult<SubmitActivityOutcome> {
        match tokio::time::timeout(self.config.submit_timeout, self.submit_inner(input)).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::StorageUnavailable(
                "submit timed out".to_string(),
            )),
        }
    }

    async fn submit_inner(
        &self,
        input: SubmitActivityInput,
    ) -> DomainResult<SubmitActivityOutcome> {
        let principal = self.credential_verifier.verify(&input.bearer_token).await?;
        debug!(caregiver_id = %principal.caregiver_id, "credential verified");

        common::garde::validate_struct(&input)?;

        // Dedup before any side effect. Not an error: the caller gets the
        // existing id and a fresh envelope is NOT published.
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = self
                .activity_repository
                .get_by_idempotency_key(GetByIdempotencyKeyRepoInput {
                    idempotency_key: key.clone(),
                    window: self.config.dedup_window,
                })
                .await?
            {
                debug!(activity_id = %existing.id, "idempotency key matched, deduplicating");
                return Ok(SubmitActivityOutcome {
                    activity_id: existing.id,
                    accepted: false,
                });
            }
        }

        let payload = self.build_payload(&input).await?;

        let activity = Activity {
            id: Uuid::new_v4().to_string(),
            subject_id: input.subject_id.clone(),
            payload,
            occurred_at: input.occurred_at,
            recorded_at: self.next_recorded_at(),
            idempotency_key: input
                .idempotency_key
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let activity_id = activity.id.clone();
        let outcome = self
            .activity_repository
            .create_with_outbox(CreateActivityRepoInput {
                partition_key: activity.subject_id.clone(),
                activity,
            })
            .await?;

        match outcome {
            CreateActivityRepoOutcome::Created => Ok(SubmitActivityOutcome {
                activity_id,
                accepted: true,
            }),
            CreateActivityRepoOutcome::Duplicate { existing } => {
                warn!(activity_id = %existing.id, "concurrent submit won the idempotency race");
                Ok(SubmitActivityOutcome {
                    activity_id: existing.id,
                    accepted: false,
                })
            }
        }
    }

    async fn build_payload(&self, input: &SubmitActivityInput) -> DomainResult<ActivityPayload> {
        if input.kind != ActivityKind::Photo {
            return ActivityPayload::from_kind_and_fields(input.kind, input.payload.clone());
        }

        // Photos: binary goes to the object store first; only the key enters
        // the activity. A store failure aborts the submit before anything is
        // persisted.
        let photo = input.photo.as_ref().ok_or_else(|| DomainError::InvalidPayload {
            kind: ActivityKind::Photo.as_str().to_string(),
            reason: "photo content is required".to_string(),
        })?;

        let content_key = Uuid::new_v4().to_string();
        self.photo_store.put(&content_key, photo.clone()).await?;

        let mut fields = match input.payload.clone() {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(DomainError::InvalidPayload {
                    kind: ActivityKind::Photo.as_str().to_string(),
                    reason: format!("payload must be an object, got {other}"),
                })
            }
        };
        fields.insert(
            "content_key".to_string(),
            serde_json::Value::String(content_key),
        );

        ActivityPayload::from_kind_and_fields(
            ActivityKind::Photo,
            serde_json::Value::Object(fields),
        )
    }

    fn next_recorded_at(&self) -> DateTime<Utc> {
        let mut last = self
            .last_recorded_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        let stamped = if now > *last { now } else { *last };
        *last = stamped;
        stamped
    }
}
