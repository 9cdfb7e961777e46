use crate::domain::{DomainError, DomainResult, PhotoStore};
use async_nats::jetstream;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Photo binary storage on the NATS JetStream object store.
///
/// Keys are opaque (UUID-based, assigned by the ingest service); nothing here
/// assumes a URL scheme. Failures surface as `StorageUnavailable` so the
/// ingest path can map them to its 503-equivalent.
pub struct NatsPhotoStore {
    store: jetstream::object_store::ObjectStore,
}

impl NatsPhotoStore {
    pub async fn new(jetstream: &jetstream::Context, bucket_name: &str) -> anyhow::Result<Self> {
        debug!(bucket = %bucket_name, "initializing photo store");

        let store = match jetstream.get_object_store(bucket_name).await {
            Ok(store) => store,
            Err(_) => {
                debug!(bucket = %bucket_name, "creating photo store bucket");
                jetstream
                    .create_object_store(jetstream::object_store::Config {
                        bucket: bucket_name.to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to create photo bucket: {e}"))?
            }
        };

        Ok(Self { store })
    }
}

#[async_trait]
impl PhotoStore for NatsPhotoStore {
    async fn put(&self, key: &str, content: bytes::Bytes) -> DomainResult<()> {
        let mut reader = &content[..];
        self.store
            .put(key, &mut reader)
            .await
            .map_err(|e| DomainError::StorageUnavailable(format!("photo upload failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> DomainResult<bytes::Bytes> {
        let mut object = self
            .store
            .get(key)
            .await
            .map_err(|e| DomainError::StorageUnavailable(format!("photo fetch failed: {e}")))?;

        let mut buf = Vec::new();
        object
            .read_to_end(&mut buf)
            .await
            .map_err(|e| DomainError::StorageUnavailable(format!("photo read failed: {e}")))?;

        Ok(bytes::Bytes::from(buf))
    }
}
