//! In-memory object store. Lives as long as the owning process; used by tests
//! and by `PIPELINE_STORE=memory` runs.

use crate::{
    models::object::{Object, ObjectMeta, VersionMarker},
    services::object_store::{ObjectStore, StoreError, StoreResult, validate_key},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Objects are replaced whole under the write lock, so readers only ever see
/// complete objects.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Object>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        source_marker: VersionMarker,
    ) -> StoreResult<ObjectMeta> {
        validate_key(key)?;
        let object = Object::new(key, bytes, source_marker);
        let meta = object.meta.clone();
        self.objects.write().await.insert(key.to_string(), object);
        debug!(key, marker = %meta.source_marker, size = meta.size_bytes, "stored object");
        Ok(meta)
    }

    async fn get(&self, key: &str) -> StoreResult<Object> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn stat(&self, key: &str) -> StoreResult<ObjectMeta> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|obj| obj.meta.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        let removed = self.objects.write().await.remove(key).is_some();
        debug!(key, removed, "deleted object");
        Ok(removed)
    }
}
