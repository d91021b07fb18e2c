//! tikvop controller: routes change events on TikvClusters and the objects
//! they own into a dedup work queue, and commits reconciled state back with
//! conflict retries.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Resource;

pub mod owner;
pub mod router;
pub mod update;
pub mod worker;

pub use owner::{resolve, resolve_controller, ResolveError, Resolution};
pub use router::{watch_for_controller, watch_for_object, ControllerEnqueuer, ObjectEnqueuer};
pub use update::{guaranteed_update, RetryPolicy, UpdateError, UpdateOutcome};
pub use worker::{process_next_work_item, run_workers, Reconciler, WorkOutcome};

pub const TIKV_GROUP: &str = "tikv.org";
pub const TIKV_VERSION: &str = "v1alpha1";
pub const TIKV_CLUSTER_KIND: &str = "TikvCluster";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_OPERATOR: &str = "tikv-operator";

pub fn tikv_cluster_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(TIKV_GROUP, TIKV_VERSION, TIKV_CLUSTER_KIND)
}

pub fn tikv_cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&tikv_cluster_gvk())
}

/// Controlling reference a TikvCluster stamps on the objects it owns.
/// `None` if the cluster has no name or uid yet.
pub fn cluster_owner_ref(tc: &DynamicObject) -> Option<OwnerReference> {
    tc.controller_owner_ref(&tikv_cluster_resource())
        .map(|r| OwnerReference { block_owner_deletion: Some(true), ..r })
}

/// Labels every operator-managed child carries.
pub fn managed_by_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY_OPERATOR.to_string())])
}

/// Runtime settings, handed to each component explicitly.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches the whole cluster.
    pub namespace: Option<String>,
    pub workers: usize,
    /// Period of full cache re-delivery; `None` disables it.
    pub resync: Option<Duration>,
    pub requeue_delay: Duration,
    pub update_retry: RetryPolicy,
    pub child_selector: Option<BTreeMap<String, String>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 5,
            resync: Some(Duration::from_secs(30)),
            requeue_delay: Duration::from_secs(1),
            update_retry: RetryPolicy::default(),
            child_selector: Some(managed_by_selector()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_ref_marks_cluster_as_controller() {
        let mut tc = DynamicObject::new("basic", &tikv_cluster_resource()).within("ns");
        assert!(cluster_owner_ref(&tc).is_none());
        tc.metadata.uid = Some("0b7c-uid".into());
        let r = cluster_owner_ref(&tc).unwrap();
        assert_eq!(r.api_version, "tikv.org/v1alpha1");
        assert_eq!(r.kind, "TikvCluster");
        assert_eq!(r.name, "basic");
        assert_eq!(r.uid, "0b7c-uid");
        assert_eq!(r.controller, Some(true));
        assert_eq!(r.block_owner_deletion, Some(true));
    }

    #[test]
    fn resource_plural() {
        assert_eq!(tikv_cluster_resource().plural, "tikvclusters");
    }
}
