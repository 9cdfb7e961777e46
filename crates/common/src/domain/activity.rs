use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A fact about a tracked child at a point in time. Created exclusively by
/// the ingest service; never mutated after the initial write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub subject_id: String,
    pub payload: ActivityPayload,
    /// Caller-supplied timestamp of the real-world event (may be in the past).
    pub occurred_at: DateTime<Utc>,
    /// Server ingestion timestamp, monotonically non-decreasing per ingest process.
    pub recorded_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl Activity {
    pub fn kind(&self) -> ActivityKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Feeding,
    Sleep,
    Diaper,
    Photo,
    Milestone,
    Vital,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Feeding => "feeding",
            ActivityKind::Sleep => "sleep",
            ActivityKind::Diaper => "diaper",
            ActivityKind::Photo => "photo",
            ActivityKind::Milestone => "milestone",
            ActivityKind::Vital => "vital",
        }
    }

    pub fn parse(s: &str) -> Option<ActivityKind> {
        match s {
            "feeding" => Some(ActivityKind::Feeding),
            "sleep" => Some(ActivityKind::Sleep),
            "diaper" => Some(ActivityKind::Diaper),
            "photo" => Some(ActivityKind::Photo),
            "milestone" => Some(ActivityKind::Milestone),
            "vital" => Some(ActivityKind::Vital),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedingType {
    BreastLeft,
    BreastRight,
    BreastBoth,
    Bottle,
    Formula,
    Solids,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiaperCondition {
    Wet,
    Dirty,
    Mixed,
    Dry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalMeasurement {
    Weight,
    Height,
    Temperature,
    HeadCircumference,
}

/// Kind-specific payload union. The pipeline treats the fields as opaque
/// beyond shape validation at ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityPayload {
    Feeding {
        feeding_type: FeedingType,
        #[serde(default)]
        amount_ml: Option<f64>,
        #[serde(default)]
        duration_min: Option<u32>,
        #[serde(default)]
        notes: Option<String>,
    },
    Sleep {
        duration_min: u32,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
    Diaper {
        condition: DiaperCondition,
        #[serde(default)]
        notes: Option<String>,
    },
    Photo {
        /// Object-store key assigned at ingest. The binary never enters the
        /// relational store.
        content_key: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Milestone {
        title: String,
        #[serde(default)]
        description: Option<String>,
    },
    Vital {
        measurement: VitalMeasurement,
        value: f64,
        unit: String,
    },
}

const MAX_FEEDING_AMOUNT_ML: f64 = 5000.0;
const MAX_DURATION_MIN: u32 = 24 * 60;

impl ActivityPayload {
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityPayload::Feeding { .. } => ActivityKind::Feeding,
            ActivityPayload::Sleep { .. } => ActivityKind::Sleep,
            ActivityPayload::Diaper { .. } => ActivityKind::Diaper,
            ActivityPayload::Photo { .. } => ActivityKind::Photo,
            ActivityPayload::Milestone { .. } => ActivityKind::Milestone,
            ActivityPayload::Vital { .. } => ActivityKind::Vital,
        }
    }

    /// Parse the kind-specific fields of `value` as a payload of `kind`.
    ///
    /// The tag is injected from `kind`, so callers submit `{"amount_ml": 120}`
    /// rather than repeating the kind inside the payload object.
    pub fn from_kind_and_fields(
        kind: ActivityKind,
        fields: serde_json::Value,
    ) -> DomainResult<ActivityPayload> {
        let mut tagged = match fields {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(DomainError::InvalidPayload {
                    kind: kind.as_str().to_string(),
                    reason: format!("payload must be an object, got {}", json_type_name(&other)),
                })
            }
        };
        tagged.insert(
            "kind".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );

        let payload: ActivityPayload = serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| DomainError::InvalidPayload {
                kind: kind.as_str().to_string(),
                reason: e.to_string(),
            })?;
        payload.validate_ranges()?;
        Ok(payload)
    }

    /// Range checks beyond structural deserialization.
    pub fn validate_ranges(&self) -> DomainResult<()> {
        let reject = |reason: String| {
            Err(DomainError::InvalidPayload {
                kind: self.kind().as_str().to_string(),
                reason,
            })
        };

        match self {
            ActivityPayload::Feeding {
                amount_ml,
                duration_min,
                ..
            } => {
                if let Some(amount) = amount_ml {
                    if !amount.is_finite() || *amount < 0.0 {
                        return reject(format!("amount_ml must be non-negative, got {amount}"));
                    }
                    if *amount > MAX_FEEDING_AMOUNT_ML {
                        return reject(format!(
                            "amount_ml exceeds {MAX_FEEDING_AMOUNT_ML} ml, got {amount}"
                        ));
                    }
                }
                if let Some(duration) = duration_min {
                    if *duration > MAX_DURATION_MIN {
                        return reject(format!(
                            "duration_min exceeds {MAX_DURATION_MIN}, got {duration}"
                        ));
                    }
                }
                Ok(())
            }
            ActivityPayload::Sleep { duration_min, .. } => {
                if *duration_min > MAX_DURATION_MIN {
                    return reject(format!(
                        "duration_min exceeds {MAX_DURATION_MIN}, got {duration_min}"
                    ));
                }
                Ok(())
            }
            ActivityPayload::Diaper { .. } => Ok(()),
            ActivityPayload::Photo { content_key, .. } => {
                if content_key.is_empty() {
                    return reject("content_key must not be empty".to_string());
                }
                Ok(())
            }
            ActivityPayload::Milestone { title, .. } => {
                if title.trim().is_empty() {
                    return reject("title must not be empty".to_string());
                }
                Ok(())
            }
            ActivityPayload::Vital { value, .. } => {
                if !value.is_finite() || *value < 0.0 {
                    return reject(format!("value must be non-negative, got {value}"));
                }
                Ok(())
            }
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Input for the transactional activity + outbox write.
#[derive(Debug, Clone)]
pub struct CreateActivityRepoInput {
    pub activity: Activity,
    pub partition_key: String,
}

#[derive(Debug, Clone)]
pub struct GetByIdempotencyKeyRepoInput {
    pub idempotency_key: String,
    /// Only matches recorded within this window count as duplicates.
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ListRecentForSubjectRepoInput {
    pub subject_id: String,
    pub limit: usize,
}

/// Repository trait for activity storage. The create path writes the activity
/// row and its outbox row in one local transaction (outbox pattern), so a
/// committed activity always has a publish intent even if the process dies
/// before the relay runs.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ActivityRepository: Send + Sync {
    /// Persist the activity and its outbox row atomically.
    ///
    /// Returns `Ok(CreateActivityRepoOutcome::Duplicate)` when another writer
    /// inserted the same idempotency key first (unique-index race).
    async fn create_with_outbox(
        &self,
        input: CreateActivityRepoInput,
    ) -> DomainResult<CreateActivityRepoOutcome>;

    async fn get_by_idempotency_key(
        &self,
        input: GetByIdempotencyKeyRepoInput,
    ) -> DomainResult<Option<Activity>>;

    /// Most recent activities for a subject, newest first.
    async fn list_recent_for_subject(
        &self,
        input: ListRecentForSubjectRepoInput,
    ) -> DomainResult<Vec<Activity>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateActivityRepoOutcome {
    Created,
    /// Lost the unique-index race to a concurrent submit with the same key.
    Duplicate { existing: Activity },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feeding_payload_parses_without_inner_tag() {
        let payload = ActivityPayload::from_kind_and_fields(
            ActivityKind::Feeding,
            json!({"feeding_type": "bottle", "amount_ml": 120.0, "duration_min": 15}),
        )
        .unwrap();

        assert_eq!(payload.kind(), ActivityKind::Feeding);
        match payload {
            ActivityPayload::Feeding {
                amount_ml,
                duration_min,
                ..
            } => {
                assert_eq!(amount_ml, Some(120.0));
                assert_eq!(duration_min, Some(15));
            }
            other => panic!("expected feeding payload, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_feeding_amount_rejected() {
        let result = ActivityPayload::from_kind_and_fields(
            ActivityKind::Feeding,
            json!({"feeding_type": "bottle", "amount_ml": -30.0}),
        );
        assert!(matches!(result, Err(DomainError::InvalidPayload { .. })));
    }

    #[test]
    fn test_kind_field_mismatch_rejected() {
        // Sleep fields submitted under the feeding kind must not parse.
        let result = ActivityPayload::from_kind_and_fields(
            ActivityKind::Feeding,
            json!({"duration_min": 45}),
        );
        assert!(matches!(result, Err(DomainError::InvalidPayload { .. })));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let result = ActivityPayload::from_kind_and_fields(ActivityKind::Diaper, json!("wet"));
        match result {
            Err(DomainError::InvalidPayload { reason, .. }) => {
                assert!(reason.contains("must be an object"));
            }
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn test_sleep_duration_cap() {
        let result = ActivityPayload::from_kind_and_fields(
            ActivityKind::Sleep,
            json!({"duration_min": 3000}),
        );
        assert!(matches!(result, Err(DomainError::InvalidPayload { .. })));
    }

    #[test]
    fn test_empty_milestone_title_rejected() {
        let result = ActivityPayload::from_kind_and_fields(
            ActivityKind::Milestone,
            json!({"title": "   "}),
        );
        assert!(matches!(result, Err(DomainError::InvalidPayload { .. })));
    }

    #[test]
    fn test_vital_payload_valid() {
        let payload = ActivityPayload::from_kind_and_fields(
            ActivityKind::Vital,
            json!({"measurement": "weight", "value": 4.2, "unit": "kg"}),
        )
        .unwrap();
        assert_eq!(payload.kind(), ActivityKind::Vital);
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [
            ActivityKind::Feeding,
            ActivityKind::Sleep,
            ActivityKind::Diaper,
            ActivityKind::Photo,
            ActivityKind::Milestone,
            ActivityKind::Vital,
        ] {
            assert_eq!(ActivityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActivityKind::parse("bath"), None);
    }
}
