//! Local object cache that turns raw watch deltas into add/update/delete
//! notifications and serves owner lookups without a network round-trip.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use kube::Resource;
use metrics::counter;
use rustc_hash::FxHashMap;
use tikvop_core::{
    key_of, Delta, DeletedObject, NotificationSource, ObjectKey, ResourceEvent, ResourceEventHandler,
    StoreError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Handlers<K> = Vec<Arc<dyn ResourceEventHandler<K>>>;

pub struct Informer<K> {
    cache: RwLock<FxHashMap<ObjectKey, Arc<K>>>,
    handlers: ArcSwap<Handlers<K>>,
    synced: AtomicBool,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(FxHashMap::default()),
            handlers: ArcSwap::from_pointee(Vec::new()),
            synced: AtomicBool::new(false),
        })
    }

    /// True once the first full list has been applied.
    pub fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.read().get(&ObjectKey::new(namespace, name)).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> { self.read().values().cloned().collect() }

    /// Cache-backed `(namespace, name)` lookup for owner resolution.
    pub fn lister(self: &Arc<Self>) -> impl Fn(&str, &str) -> Result<Arc<K>, StoreError> + Send + Sync + 'static {
        let me = Arc::clone(self);
        move |ns: &str, name: &str| me.get(Some(ns), name).ok_or_else(|| StoreError::NotFound(ObjectKey::new(Some(ns), name)))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.cache.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.cache.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Fold a delta into the cache and notify handlers. Handlers run after the
    /// cache lock is released so they may read the cache themselves.
    pub fn apply(&self, delta: Delta<K>) {
        let events: Vec<ResourceEvent<K>> = match delta {
            Delta::Applied(obj) => self.upsert(obj).into_iter().collect(),
            Delta::Deleted(obj) => {
                let Some(key) = keyed(&obj) else { return };
                self.write().remove(&key);
                vec![ResourceEvent::Deleted(DeletedObject::Final(obj))]
            }
            Delta::Restarted(list) => self.replace(list),
        };
        self.dispatch(&events);
    }

    fn upsert(&self, obj: K) -> Option<ResourceEvent<K>> {
        let key = keyed(&obj)?;
        let prev = self.write().insert(key, Arc::new(obj.clone()));
        Some(match prev {
            Some(old) => ResourceEvent::Updated { old: (*old).clone(), new: obj },
            None => ResourceEvent::Added(obj),
        })
    }

    fn replace(&self, list: Vec<K>) -> Vec<ResourceEvent<K>> {
        let mut fresh: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
        for obj in list {
            if let Some(key) = keyed(&obj) {
                fresh.insert(key, Arc::new(obj));
            }
        }
        let mut events = Vec::with_capacity(fresh.len());
        {
            let mut cache = self.write();
            for (key, old) in cache.iter() {
                if !fresh.contains_key(key) {
                    events.push(ResourceEvent::Deleted(DeletedObject::Tombstone {
                        key: key.clone(),
                        last_known: Some((**old).clone()),
                    }));
                }
            }
            for (key, obj) in fresh.iter() {
                events.push(match cache.get(key) {
                    Some(old) => ResourceEvent::Updated { old: (**old).clone(), new: (**obj).clone() },
                    None => ResourceEvent::Added((**obj).clone()),
                });
            }
            *cache = fresh;
        }
        self.synced.store(true, Ordering::Release);
        debug!(count = events.len(), "relist applied");
        events
    }

    /// Re-deliver every cached object as an update with identical old and new.
    pub fn resync(&self) {
        let events: Vec<_> = self
            .read()
            .values()
            .map(|o| ResourceEvent::Updated { old: (**o).clone(), new: (**o).clone() })
            .collect();
        counter!("informer_resyncs_total", 1u64);
        self.dispatch(&events);
    }

    fn dispatch(&self, events: &[ResourceEvent<K>]) {
        let handlers = self.handlers.load();
        for ev in events {
            for h in handlers.iter() {
                h.handle(ev);
            }
        }
    }
}

fn keyed<K: Resource>(obj: &K) -> Option<ObjectKey> {
    match key_of(obj) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "skipping object without identity");
            None
        }
    }
}

impl<K> NotificationSource<K> for Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.rcu(|cur| {
            let mut next: Handlers<K> = (**cur).clone();
            next.push(Arc::clone(&handler));
            next
        });
    }
}

/// Spawn the ingest loop feeding `informer` from `rx`, with an optional
/// periodic resync. The loop ends when the sender side is dropped.
pub fn spawn_ingest<K>(informer: Arc<Informer<K>>, mut rx: mpsc::Receiver<Delta<K>>, resync: Option<Duration>) -> JoinHandle<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let period = resync.unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => informer.apply(d),
                        None => {
                            debug!("delta channel closed; exiting ingest loop");
                            break;
                        }
                    }
                }
                _ = ticker.tick(), if resync.is_some() => informer.resync(),
            }
        }
        info!("ingest loop stopped");
    })
}
