//! Blob and cache contracts with in-memory implementations

use crate::error::ConnectorResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque byte storage keyed by string
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> ConnectorResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ConnectorResult<()>;
    async fn del(&self, key: &str) -> ConnectorResult<()>;
}

/// Volatile cache with the same surface as the blob store
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> ConnectorResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> ConnectorResult<()>;
    async fn del(&self, key: &str) -> ConnectorResult<()>;
}

/// In-memory blob store
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> ConnectorResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> ConnectorResult<()> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn del(&self, key: &str) -> ConnectorResult<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryBlobStore {
    async fn get(&self, key: &str) -> ConnectorResult<Option<Vec<u8>>> {
        BlobStore::get(self, key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> ConnectorResult<()> {
        BlobStore::put(self, key, bytes).await
    }

    async fn del(&self, key: &str) -> ConnectorResult<()> {
        BlobStore::del(self, key).await
    }
}
