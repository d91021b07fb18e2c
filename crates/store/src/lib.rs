//! tikvop store: the informer cache that feeds event handlers and the
//! deduplicating work queue that sits between event delivery and workers.

#![forbid(unsafe_code)]

mod informer;
mod queue;

pub use informer::{spawn_ingest, Informer};
pub use queue::{DedupQueue, MAX_REQUEUE_DELAY};
