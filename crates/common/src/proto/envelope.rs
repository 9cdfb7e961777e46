use crate::domain::{
    Activity, ActivityKind, ActivityPayload, DomainError, DomainResult, Envelope,
};
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

/// Wire form of an [`Envelope`].
///
/// prost ignores unknown tags on decode, so newer producers can add fields
/// without breaking older consumers; missing fields decode to defaults, so
/// older producers stay readable. `schema_version` tags the layout for
/// consumers that need to branch.
#[derive(Clone, PartialEq, Message)]
pub struct EnvelopeMessage {
    #[prost(uint32, tag = "1")]
    pub schema_version: u32,
    #[prost(string, tag = "2")]
    pub activity_id: String,
    #[prost(string, tag = "3")]
    pub partition_key: String,
    #[prost(uint64, tag = "4")]
    pub sequence: u64,
    #[prost(string, tag = "5")]
    pub subject_id: String,
    #[prost(string, tag = "6")]
    pub kind: String,
    /// Kind-specific fields as canonical JSON (the payload union without its
    /// tag).
    #[prost(string, tag = "7")]
    pub payload_json: String,
    #[prost(int64, tag = "8")]
    pub occurred_at_ms: i64,
    #[prost(int64, tag = "9")]
    pub recorded_at_ms: i64,
    #[prost(string, tag = "10")]
    pub idempotency_key: String,
    #[prost(int64, tag = "11")]
    pub published_at_ms: i64,
}

pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

pub fn envelope_to_wire(envelope: &Envelope) -> EnvelopeMessage {
    let payload_json = payload_fields_json(&envelope.activity.payload);
    EnvelopeMessage {
        schema_version: ENVELOPE_SCHEMA_VERSION,
        activity_id: envelope.activity.id.clone(),
        partition_key: envelope.partition_key.clone(),
        sequence: envelope.sequence,
        subject_id: envelope.activity.subject_id.clone(),
        kind: envelope.activity.kind().as_str().to_string(),
        payload_json,
        occurred_at_ms: envelope.activity.occurred_at.timestamp_millis(),
        recorded_at_ms: envelope.activity.recorded_at.timestamp_millis(),
        idempotency_key: envelope.activity.idempotency_key.clone(),
        published_at_ms: envelope.published_at.timestamp_millis(),
    }
}

pub fn envelope_from_wire(message: EnvelopeMessage) -> DomainResult<Envelope> {
    let kind = ActivityKind::parse(&message.kind).ok_or_else(|| {
        DomainError::EnvelopeConversionError(format!("unknown activity kind: {}", message.kind))
    })?;

    let fields: serde_json::Value = serde_json::from_str(&message.payload_json)
        .map_err(|e| DomainError::EnvelopeConversionError(format!("bad payload json: {e}")))?;
    let payload = ActivityPayload::from_kind_and_fields(kind, fields).map_err(|e| {
        DomainError::EnvelopeConversionError(format!("payload does not match kind: {e}"))
    })?;

    Ok(Envelope {
        activity: Activity {
            id: message.activity_id,
            subject_id: message.subject_id,
            payload,
            occurred_at: millis_to_datetime(message.occurred_at_ms)?,
            recorded_at: millis_to_datetime(message.recorded_at_ms)?,
            idempotency_key: message.idempotency_key,
        },
        partition_key: message.partition_key,
        sequence: message.sequence,
        published_at: millis_to_datetime(message.published_at_ms)?,
    })
}

/// Serialize the payload union's fields without the `kind` tag; the tag
/// travels in its own wire field.
fn payload_fields_json(payload: &ActivityPayload) -> String {
    let mut value = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
    if let serde_json::Value::Object(ref mut map) = value {
        map.remove("kind");
    }
    value.to_string()
}

fn millis_to_datetime(ms: i64) -> DomainResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DomainError::EnvelopeConversionError(format!("timestamp out of range: {ms}")))
}
