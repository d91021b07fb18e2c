//! tikvop core types: keys, events, error sentinels and the seams between the
//! event router, the work queue and the object store.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::error;

pub mod errors;
pub mod key;
pub mod meta;
pub mod store;

pub use errors::{classify, is_ignore_error, is_requeue_error, ErrorClass, IgnoreError, RequeueError};
pub use key::{deletion_key, key_of, KeyError, ObjectKey};
pub use meta::{controller_of, is_sub_map_of, parse_group_version, GroupVersionError, TypeIdentity};
pub use store::{ObjectStore, StoreError};

#[doc(hidden)]
pub use anyhow as __anyhow;

/// Raw change coming off a watch stream, before it is diffed against a cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Delta<K> {
    Applied(K),
    Deleted(K),
    /// Full relist; anything cached but absent here was deleted while unobserved.
    Restarted(Vec<K>),
}

/// Object handed to delete handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedObject<K> {
    /// Observed deletion with the object's final state.
    Final(K),
    /// Deletion inferred from a relist; only the cached key is reliable.
    Tombstone { key: ObjectKey, last_known: Option<K> },
}

impl<K> DeletedObject<K> {
    /// Last known state of the object, if the cache still had one.
    pub fn object(&self) -> Option<&K> {
        match self {
            DeletedObject::Final(obj) => Some(obj),
            DeletedObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Create/update/delete notification delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(DeletedObject<K>),
}

pub trait ResourceEventHandler<K>: Send + Sync {
    /// Called on the delivering thread; must not block.
    fn handle(&self, event: &ResourceEvent<K>);
}

pub trait NotificationSource<K> {
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>);
}

/// Producer side of a deduplicating work queue.
pub trait WorkQueue: Send + Sync {
    /// Idempotent while `key` is pending.
    fn add(&self, key: String);
}

impl<Q: WorkQueue + ?Sized> WorkQueue for Arc<Q> {
    fn add(&self, key: String) { (**self).add(key) }
}

/// Side channel for failures that must not stop event delivery.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: anyhow::Error);
}

/// Logs and counts reported errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: anyhow::Error) {
        counter!("handled_errors_total", 1u64);
        error!(error = %format!("{:#}", err), "dropping event");
    }
}

pub mod prelude {
    pub use super::{
        key_of, Delta, DeletedObject, ErrorReporter, NotificationSource, ObjectKey, ObjectStore,
        ResourceEvent, ResourceEventHandler, StoreError, WorkQueue,
    };
}
