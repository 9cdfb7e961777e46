use async_trait::async_trait;
use common::domain::{Activity, Enricher, EnrichmentContext, EnrichmentError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct HttpEnricherConfig {
    /// Base URL of the AI capability, e.g. `http://enricher:9000`.
    pub base_url: String,
    /// Credential the capability expects, if any.
    pub api_key: Option<String>,
    /// Transport-level timeout. The worker applies its own per-call bound on
    /// top of this.
    pub request_timeout: Duration,
}

/// Request body for the enrichment endpoint. Activities serialize with their
/// full payload union so the capability sees what the client recorded.
#[derive(Debug, Serialize)]
struct EnrichRequest<'a> {
    subject_id: &'a str,
    derivation_key: &'a str,
    triggering_activity: &'a Activity,
    recent_activities: &'a [Activity],
}

#[derive(Debug, Deserialize)]
struct EnrichResponse {
    content: String,
}

/// The AI capability over HTTP.
///
/// The capability is opaque: one POST in, one insight text out. Status codes
/// drive the retry classification — client-fault rejections are permanent,
/// everything that can heal (timeouts, rate limits, 5xx) is transient.
pub struct HttpEnricher {
    client: reqwest::Client,
    config: HttpEnricherConfig,
}

impl HttpEnricher {
    pub fn new(config: HttpEnricherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

/// Map a non-success status to the retry classification.
fn classify_status(status: StatusCode, body: &str) -> EnrichmentError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        EnrichmentError::Transient(format!("ai capability returned {status}: {body}"))
    } else {
        EnrichmentError::Permanent(format!("ai capability rejected input ({status}): {body}"))
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    #[instrument(skip(self, context), fields(subject_id = %context.subject_id, derivation_key = %context.derivation_key))]
    async fn enrich(&self, context: &EnrichmentContext) -> Result<String, EnrichmentError> {
        let url = format!("{}/v1/enrich", self.config.base_url.trim_end_matches('/'));
        let body = EnrichRequest {
            subject_id: &context.subject_id,
            derivation_key: &context.derivation_key,
            triggering_activity: &context.triggering_activity,
            recent_activities: &context.recent_activities,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EnrichmentError::Transient(format!("ai capability unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: EnrichResponse = response.json().await.map_err(|e| {
            EnrichmentError::Transient(format!("malformed enrichment response: {e}"))
        })?;

        debug!(content_len = parsed.content.len(), "enrichment received");
        Ok(parsed.content)
    }
}
