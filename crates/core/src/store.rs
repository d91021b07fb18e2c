//! Remote object store seam used by the guaranteed updater and owner lookups.

#![forbid(unsafe_code)]

use crate::ObjectKey;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    /// The write was based on a superseded resourceVersion.
    #[error("conflict writing {key}: {message}")]
    Conflict { key: ObjectKey, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

/// Versioned object store with optimistic concurrency.
///
/// `update` must reject writes whose `metadata.resourceVersion` is stale with
/// [`StoreError::Conflict`] and return the stored object on success.
#[async_trait::async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;
    async fn update(&self, obj: &K) -> Result<K, StoreError>;
}

#[async_trait::async_trait]
impl<K, S> ObjectStore<K> for std::sync::Arc<S>
where
    K: Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
{
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> { (**self).get(key).await }
    async fn update(&self, obj: &K) -> Result<K, StoreError> { (**self).update(obj).await }
}
