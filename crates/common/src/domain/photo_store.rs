use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Durable object store for photo binaries, addressed by an opaque key. The
/// pipeline stores only the key and assumes nothing about the backing URL
/// scheme.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn put(&self, key: &str, content: bytes::Bytes) -> DomainResult<()>;

    async fn get(&self, key: &str) -> DomainResult<bytes::Bytes>;
}
