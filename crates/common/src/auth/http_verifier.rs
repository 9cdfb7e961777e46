use crate::auth::{CaregiverPrincipal, CredentialVerifier};
use crate::domain::{DomainError, DomainResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    caregiver_id: String,
}

/// Verifies bearer credentials against the external identity provider's
/// introspection endpoint.
///
/// The pipeline never issues or refreshes credentials; a rejected credential
/// is `AuthenticationError` (surfaced immediately, never retried), while an
/// unreachable provider is an infrastructure error so the boundary answers
/// 5xx rather than falsely claiming the caller is unauthenticated.
pub struct HttpCredentialVerifier {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpCredentialVerifier {
    pub fn new(verify_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, verify_url })
    }
}

#[async_trait]
impl CredentialVerifier for HttpCredentialVerifier {
    #[instrument(skip(self, bearer_token))]
    async fn verify(&self, bearer_token: &str) -> DomainResult<CaregiverPrincipal> {
        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow::anyhow!("identity provider unreachable: {e}"))
            })?;

        match response.status() {
            status if status.is_success() => {
                let verified: VerifyResponse = response.json().await.map_err(|e| {
                    DomainError::RepositoryError(anyhow::anyhow!(
                        "malformed identity response: {e}"
                    ))
                })?;
                debug!(caregiver_id = %verified.caregiver_id, "credential verified");
                Ok(CaregiverPrincipal {
                    caregiver_id: verified.caregiver_id,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                DomainError::AuthenticationError("credential rejected by identity provider".into()),
            ),
            other => Err(DomainError::RepositoryError(anyhow::anyhow!(
                "identity provider returned {other}"
            ))),
        }
    }
}
