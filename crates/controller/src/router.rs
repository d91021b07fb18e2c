//! Event routing: turn change notifications into reconcile keys.
//!
//! Two modes are offered:
//! - direct ([`watch_for_object`]): enqueue the changed object's own key;
//! - indirect ([`watch_for_controller`]): enqueue the key of the object's
//!   controller, optionally only for objects matching a label selector.
//!
//! Handlers never block and never dedup; the queue does that. Failures go to
//! the [`ErrorReporter`] and the event is dropped: a later event for the same
//! object (at the latest the periodic resync) re-triggers the enqueue.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use kube::Resource;
use metrics::counter;
use tikvop_core::{
    deletion_key, is_sub_map_of, key_of, ErrorReporter, NotificationSource, ResourceEvent, ResourceEventHandler,
    StoreError, TypeIdentity, WorkQueue,
};
use tracing::{debug, trace};

use crate::owner::{resolve, Resolution};

/// Enqueues the key of every added, updated or deleted object.
pub struct ObjectEnqueuer<Q> {
    queue: Q,
    reporter: Arc<dyn ErrorReporter>,
}

impl<Q: WorkQueue> ObjectEnqueuer<Q> {
    pub fn new(queue: Q, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { queue, reporter }
    }
}

impl<K, Q> ResourceEventHandler<K> for ObjectEnqueuer<Q>
where
    K: Resource,
    Q: WorkQueue,
{
    fn handle(&self, event: &ResourceEvent<K>) {
        let key = match event {
            ResourceEvent::Added(obj) | ResourceEvent::Updated { new: obj, .. } => key_of(obj),
            ResourceEvent::Deleted(deleted) => deletion_key(deleted),
        };
        match key {
            Ok(key) => {
                counter!("router_enqueued_total", 1u64, "mode" => "object");
                trace!(key = %key, "enqueue");
                self.queue.add(key.to_string());
            }
            Err(e) => self.reporter.report(anyhow::Error::new(e).context("couldn't get key for object")),
        }
    }
}

/// Enqueues the key of the controller of every matching object.
pub struct ControllerEnqueuer<Q, F> {
    queue: Q,
    lookup: F,
    selector: Option<BTreeMap<String, String>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl<Q, F> ControllerEnqueuer<Q, F> {
    pub fn new(queue: Q, lookup: F, selector: Option<BTreeMap<String, String>>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { queue, lookup, selector, reporter }
    }
}

fn dropped(reason: &'static str) {
    counter!("router_events_dropped_total", 1u64, "reason" => reason);
}

impl<K, C, Q, F> ResourceEventHandler<K> for ControllerEnqueuer<Q, F>
where
    K: Resource,
    C: Resource + TypeIdentity,
    Q: WorkQueue,
    F: Fn(&str, &str) -> Result<Arc<C>, StoreError> + Send + Sync,
{
    fn handle(&self, event: &ResourceEvent<K>) {
        let obj = match event {
            ResourceEvent::Added(obj) | ResourceEvent::Updated { new: obj, .. } => obj,
            ResourceEvent::Deleted(deleted) => match deleted.object() {
                Some(obj) => obj,
                None => {
                    dropped("tombstone_without_object");
                    debug!("deleted object has no last known state, cannot find its controller");
                    return;
                }
            },
        };
        if let Some(selector) = &self.selector {
            if !is_sub_map_of(selector, obj.meta().labels.as_ref()) {
                dropped("label_mismatch");
                trace!(name = ?obj.meta().name, "labels do not match selector");
                return;
            }
        }
        let controller = match resolve(obj, &self.lookup) {
            Ok(Resolution::Found(c)) => c,
            Ok(Resolution::NoController) => return dropped("no_controller"),
            Ok(Resolution::NotFound) => return dropped("controller_not_found"),
            Ok(Resolution::Mismatch { .. }) => return dropped("controller_kind_mismatch"),
            Err(e) => return self.reporter.report(e.into()),
        };
        match key_of(&*controller).context("couldn't get key for controller") {
            Ok(key) => {
                counter!("router_enqueued_total", 1u64, "mode" => "controller");
                trace!(key = %key, "enqueue controller");
                self.queue.add(key.to_string());
            }
            Err(e) => self.reporter.report(e),
        }
    }
}

/// Direct mode: every event on `source` enqueues the object's own key.
pub fn watch_for_object<K, S, Q>(source: &S, queue: Q, reporter: Arc<dyn ErrorReporter>)
where
    K: Resource + 'static,
    S: NotificationSource<K> + ?Sized,
    Q: WorkQueue + 'static,
{
    source.add_event_handler(Arc::new(ObjectEnqueuer::new(queue, reporter)));
}

/// Indirect mode: every event on `source` whose labels contain `selector`
/// enqueues the key of the object's controller, as found by `lookup`.
pub fn watch_for_controller<K, C, S, Q, F>(
    source: &S,
    queue: Q,
    lookup: F,
    selector: Option<BTreeMap<String, String>>,
    reporter: Arc<dyn ErrorReporter>,
) where
    K: Resource + 'static,
    C: Resource + TypeIdentity + 'static,
    S: NotificationSource<K> + ?Sized,
    Q: WorkQueue + 'static,
    F: Fn(&str, &str) -> Result<Arc<C>, StoreError> + Send + Sync + 'static,
{
    source.add_event_handler(Arc::new(ControllerEnqueuer::new(queue, lookup, selector, reporter)));
}
