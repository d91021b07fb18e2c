#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::core::DynamicObject;
use tikvop_controller::{
    cluster_owner_ref, guaranteed_update, managed_by_selector, run_workers, tikv_cluster_resource, watch_for_controller,
    watch_for_object, Reconciler, RetryPolicy, UpdateOutcome,
};
use tikvop_core::{key_of, Delta, LogReporter, ObjectKey, ObjectStore, StoreError};
use tikvop_store::{DedupQueue, Informer};

fn cluster(name: &str, rv: &str) -> DynamicObject {
    let mut tc = DynamicObject::new(name, &tikv_cluster_resource()).within("ns");
    tc.metadata.uid = Some(format!("uid-{}", name));
    tc.metadata.resource_version = Some(rv.into());
    tc.data = serde_json::json!({ "spec": { "tikv": { "replicas": 3 } } });
    tc
}

fn child_of(tc: &DynamicObject, name: &str, rv: &str) -> StatefulSet {
    let mut sts = StatefulSet::default();
    sts.metadata.namespace = Some("ns".into());
    sts.metadata.name = Some(name.into());
    sts.metadata.resource_version = Some(rv.into());
    sts.metadata.labels = Some(managed_by_selector());
    sts.metadata.owner_references = Some(vec![cluster_owner_ref(tc).unwrap()]);
    sts
}

#[tokio::test]
async fn rapid_child_updates_collapse_to_one_parent_key() {
    let clusters = Informer::<DynamicObject>::new();
    let statefulsets = Informer::<StatefulSet>::new();
    let queue = DedupQueue::new();

    watch_for_controller(
        &*statefulsets,
        Arc::clone(&queue),
        clusters.lister(),
        None,
        Arc::new(LogReporter),
    );

    let tc = cluster("basic", "1");
    clusters.apply(Delta::Restarted(vec![tc.clone()]));
    statefulsets.apply(Delta::Restarted(vec![child_of(&tc, "basic-tikv", "10")]));
    assert_eq!(queue.len(), 1);
    statefulsets.apply(Delta::Applied(child_of(&tc, "basic-tikv", "11")));
    statefulsets.apply(Delta::Applied(child_of(&tc, "basic-tikv", "12")));

    assert_eq!(queue.len(), 1, "updates for the same parent must collapse");
    assert_eq!(queue.get().await.as_deref(), Some("ns/basic"));
}

#[tokio::test]
async fn parent_and_child_events_share_the_parent_key() {
    let clusters = Informer::<DynamicObject>::new();
    let statefulsets = Informer::<StatefulSet>::new();
    let queue = DedupQueue::new();
    watch_for_object(&*clusters, Arc::clone(&queue), Arc::new(LogReporter));
    watch_for_controller(
        &*statefulsets,
        Arc::clone(&queue),
        clusters.lister(),
        Some(managed_by_selector()),
        Arc::new(LogReporter),
    );

    let tc = cluster("basic", "1");
    clusters.apply(Delta::Applied(tc.clone()));
    statefulsets.apply(Delta::Applied(child_of(&tc, "basic-pd", "3")));
    let mut unlabelled = child_of(&tc, "basic-tikv", "4");
    unlabelled.metadata.labels = None;
    statefulsets.apply(Delta::Applied(unlabelled));
    assert_eq!(queue.len(), 1);

    // child of a cluster that is already gone
    let orphan = child_of(&cluster("gone", "1"), "gone-tikv", "5");
    assert_eq!(queue.get().await.as_deref(), Some("ns/basic"));
    statefulsets.apply(Delta::Applied(orphan));
    assert!(queue.is_empty());
}

/// Versioned in-memory store for TikvClusters.
#[derive(Default)]
struct MemStore {
    objects: Mutex<Vec<DynamicObject>>,
    writes: Mutex<u32>,
}

#[async_trait::async_trait]
impl ObjectStore<DynamicObject> for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|o| key_of(*o).ok().as_ref() == Some(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(obj).unwrap();
        let mut objects = self.objects.lock().unwrap();
        let slot = objects
            .iter_mut()
            .find(|o| key_of(&**o).ok().as_ref() == Some(&key))
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if slot.metadata.resource_version != obj.metadata.resource_version {
            return Err(StoreError::Conflict { key, message: "stale".into() });
        }
        let rv: u64 = obj.metadata.resource_version.as_deref().unwrap_or("0").parse().unwrap();
        let mut next = obj.clone();
        next.metadata.resource_version = Some((rv + 1).to_string());
        *slot = next.clone();
        *self.writes.lock().unwrap() += 1;
        Ok(next)
    }
}

/// Records the observed replica count in an annotation.
struct AnnotateReplicas {
    store: Arc<MemStore>,
}

#[async_trait::async_trait]
impl Reconciler for AnnotateReplicas {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let mut tc = DynamicObject::new(&key.name, &tikv_cluster_resource());
        tc.metadata.namespace = key.namespace.clone();
        guaranteed_update(self.store.as_ref(), &mut tc, &RetryPolicy::default(), |tc: &mut DynamicObject| {
            let replicas = tc.data["spec"]["tikv"]["replicas"].as_i64().unwrap_or(0);
            tc.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert("tikv.org/observed-replicas".into(), replicas.to_string());
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconciling_twice_writes_once() {
    let store = Arc::new(MemStore::default());
    store.objects.lock().unwrap().push(cluster("basic", "1"));
    let queue = DedupQueue::new();
    let handles = run_workers(
        Arc::clone(&queue),
        Arc::new(AnnotateReplicas { store: Arc::clone(&store) }),
        2,
        Duration::from_millis(5),
    );

    queue.push("ns/basic".into());
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.push("ns/basic".into());
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.shut_down();
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(*store.writes.lock().unwrap(), 1, "second pass must see no change");
    let stored = store.get(&ObjectKey::new(Some("ns"), "basic")).await.unwrap();
    assert_eq!(stored.metadata.annotations.unwrap()["tikv.org/observed-replicas"], "3");
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn updater_reports_unchanged_directly() {
    let store = MemStore::default();
    store.objects.lock().unwrap().push(cluster("basic", "7"));
    let mut tc = DynamicObject::new("basic", &tikv_cluster_resource()).within("ns");
    let out = guaranteed_update(&store, &mut tc, &RetryPolicy::default(), |_: &mut DynamicObject| Ok(()))
        .await
        .unwrap();
    assert_eq!(out, UpdateOutcome::Unchanged);
    assert_eq!(tc.metadata.resource_version.as_deref(), Some("7"));
    assert_eq!(*store.writes.lock().unwrap(), 0);
}
