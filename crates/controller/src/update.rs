//! Conflict-safe read/mutate/write against a versioned store.

#![forbid(unsafe_code)]

use std::time::Duration;

use kube::Resource;
use metrics::counter;
use serde::Serialize;
use tikvop_core::{key_of, KeyError, ObjectKey, ObjectStore, StoreError};
use tracing::debug;

/// Bound on conflict retries. `max_retries` conflicts are retried; the next
/// one is returned as [`UpdateError::RetriesExhausted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 4, backoff: Duration::from_millis(10) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The mutation left the object as fetched; nothing was written.
    Unchanged,
    Updated,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("fetching {key}")]
    Fetch {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("encoding {key} for comparison")]
    Encode {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("mutating {key}")]
    Mutate {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("writing {key}")]
    Write {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("giving up on {key} after {attempts} conflicting writes")]
    RetriesExhausted {
        key: ObjectKey,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

fn snapshot<K: Serialize>(obj: &K, key: &ObjectKey) -> Result<serde_json::Value, UpdateError> {
    serde_json::to_value(obj).map_err(|source| UpdateError::Encode { key: key.clone(), source })
}

/// Fetch the latest `obj` from `store`, apply `mutate` to it, and write it
/// back if anything changed, retrying on version conflicts.
///
/// `obj` only needs its namespace and name set on entry; it is overwritten by
/// the fetched object on every attempt and by the stored object after a
/// successful write. `mutate` may therefore run more than once and must work
/// from whatever state it is handed.
pub async fn guaranteed_update<K, S, F>(
    store: &S,
    obj: &mut K,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<UpdateOutcome, UpdateError>
where
    K: Resource + Serialize + Send + Sync,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> anyhow::Result<()>,
{
    let key = key_of(obj)?;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        *obj = store
            .get(&key)
            .await
            .map_err(|source| UpdateError::Fetch { key: key.clone(), source })?;
        let before = snapshot(obj, &key)?;
        mutate(obj).map_err(|source| UpdateError::Mutate { key: key.clone(), source })?;
        if snapshot(obj, &key)? == before {
            debug!(key = %key, "object unchanged; skipping write");
            return Ok(UpdateOutcome::Unchanged);
        }
        match store.update(obj).await {
            Ok(stored) => {
                *obj = stored;
                counter!("guaranteed_update_writes_total", 1u64);
                return Ok(UpdateOutcome::Updated);
            }
            Err(e) if e.is_conflict() => {
                counter!("guaranteed_update_conflicts_total", 1u64);
                if attempts > policy.max_retries {
                    return Err(UpdateError::RetriesExhausted { key, attempts, source: e });
                }
                debug!(key = %key, attempt = attempts, "write conflict; refetching");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
            Err(source) => return Err(UpdateError::Write { key, source }),
        }
    }
}
