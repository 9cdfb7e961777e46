use crate::domain::{
    ActivityIngestionService, GetLatestInsightInput, InsightQueryService, SubmitActivityInput,
};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use common::domain::{ActivityKind, DomainError, Insight};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Shared handler state: the two domain services the boundary fronts.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<ActivityIngestionService>,
    pub insights: Arc<InsightQueryService>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/activities", post(submit_activity))
        .route("/v1/insights", get(get_insight))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubmitActivityRequest {
    subject_id: String,
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    idempotency_key: Option<String>,
    /// Photo binary, base64-encoded. Required for kind = photo.
    #[serde(default)]
    photo_base64: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitActivityResponse {
    activity_id: String,
    accepted: bool,
}

#[derive(Debug, Deserialize)]
struct GetInsightParams {
    subject_id: String,
    derivation_key: String,
}

#[derive(Debug, Serialize)]
struct InsightResponse {
    id: String,
    subject_id: String,
    derivation_key: String,
    derived_from: Vec<String>,
    version: u32,
    content: String,
    status: String,
    generated_at: DateTime<Utc>,
}

impl From<Insight> for InsightResponse {
    fn from(insight: Insight) -> Self {
        Self {
            id: insight.id,
            subject_id: insight.subject_id,
            derivation_key: insight.derivation_key,
            derived_from: insight.derived_from.into_iter().collect(),
            version: insight.version,
            content: insight.content,
            status: insight.status.as_str().to_string(),
            generated_at: insight.generated_at,
        }
    }
}

async fn submit_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitActivityRequest>,
) -> Result<Json<SubmitActivityResponse>, ApiError> {
    let bearer_token = bearer_from_headers(&headers)?;

    let kind = ActivityKind::parse(&request.kind).ok_or_else(|| {
        ApiError(DomainError::ValidationError(format!(
            "unknown activity kind: {}",
            request.kind
        )))
    })?;

    let photo = request
        .photo_base64
        .as_deref()
        .map(|encoded| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map(bytes::Bytes::from)
                .map_err(|e| {
                    ApiError(DomainError::ValidationError(format!(
                        "photo_base64 is not valid base64: {e}"
                    )))
                })
        })
        .transpose()?;

    let outcome = state
        .ingestion
        .submit(SubmitActivityInput {
            bearer_token,
            subject_id: request.subject_id,
            kind,
            payload: request.payload,
            occurred_at: request.occurred_at,
            idempotency_key: request.idempotency_key,
            photo,
        })
        .await?;

    Ok(Json(SubmitActivityResponse {
        activity_id: outcome.activity_id,
        accepted: outcome.accepted,
    }))
}

async fn get_insight(
    State(state): State<AppState>,
    Query(params): Query<GetInsightParams>,
) -> Result<Json<InsightResponse>, ApiError> {
    let insight = state
        .insights
        .get_latest(GetLatestInsightInput {
            subject_id: params.subject_id,
            derivation_key: params.derivation_key,
        })
        .await?;

    Ok(Json(InsightResponse::from(insight)))
}

fn bearer_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .ok_or_else(|| {
            ApiError(DomainError::AuthenticationError(
                "missing bearer credential".to_string(),
            ))
        })
}

/// Transport mapping of the domain taxonomy. Infrastructure detail never
/// reaches the wire.
struct ApiError(DomainError);

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            DomainError::ValidationError(_)
            | DomainError::InvalidPayload { .. }
            | DomainError::EnvelopeConversionError(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            DomainError::AuthenticationError(_) => (StatusCode::UNAUTHORIZED, self.0.to_string()),
            DomainError::ActivityNotFound(_) | DomainError::InsightNotFound { .. } => {
                (StatusCode::NOT_FOUND, self.0.to_string())
            }
            DomainError::VersionConflict { .. } => (StatusCode::CONFLICT, self.0.to_string()),
            DomainError::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string())
            }
            DomainError::RepositoryError(e) => {
                error!(error = %e, "internal error on ingest boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
