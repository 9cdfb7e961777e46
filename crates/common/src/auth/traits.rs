use crate::domain::DomainResult;
use async_trait::async_trait;

/// The caller identity established by the external identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CaregiverPrincipal {
    pub caregiver_id: String,
}

/// Seam to the black-box identity provider. The pipeline never issues
/// credentials; it only verifies the opaque bearer value handed to it and
/// surfaces `AuthenticationError` immediately on failure, never retrying.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, bearer_token: &str) -> DomainResult<CaregiverPrincipal>;
}
