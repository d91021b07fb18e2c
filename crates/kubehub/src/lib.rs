//! tikvop kubehub: kube client, API discovery, watch streams feeding the
//! informer, and a kube-backed object store for the guaranteed updater.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tikvop_core::{key_of, Delta, ObjectKey, ObjectStore, StoreError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK to its served resource and scope via discovery.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Api for a dynamically typed resource, scoped to `namespace` when the kind is namespaced.
pub fn dynamic_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// List+watch `api` and forward deltas into `delta_tx` until the receiver is
/// dropped. Watch errors are logged and retried with backoff. `kind` only
/// labels logs and metrics.
pub async fn start_watcher<K>(
    api: Api<K>,
    kind: &str,
    cfg: watcher::Config,
    delta_tx: mpsc::Sender<Delta<K>>,
) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = kind.to_string();
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    while let Some(ev) = stream.next().await {
        let delta = match ev {
            Ok(Event::Applied(o)) => Delta::Applied(o),
            Ok(Event::Deleted(o)) => Delta::Deleted(o),
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                Delta::Restarted(list)
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64, "kind" => kind.clone());
                warn!(kind = %kind, error = %e, "watch error; backing off");
                continue;
            }
        };
        if delta_tx.send(delta).await.is_err() {
            debug!(kind = %kind, "delta receiver dropped; stopping watcher");
            return Ok(());
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

/// Kube-backed store for one dynamically typed kind.
#[derive(Clone)]
pub struct DynamicStore {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl DynamicStore {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }

    /// Discover the resource behind `gvk_key` and build a store for it.
    pub async fn discover(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        Ok(Self::new(client, ar, namespaced))
    }

    pub fn api_resource(&self) -> &ApiResource { &self.ar }

    pub fn namespaced(&self) -> bool { self.namespaced }

    fn api(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, StoreError> {
        if self.namespaced && key.namespace.is_none() {
            return Err(anyhow!("namespace required for namespaced kind {}", self.ar.kind).into());
        }
        Ok(dynamic_api(self.client.clone(), &self.ar, self.namespaced, key.namespace.as_deref()))
    }
}

/// Map API status codes onto the store taxonomy: 404 not found, 409 conflict.
pub fn store_error(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict { key: key.clone(), message: resp.message },
        other => StoreError::Other(anyhow::Error::new(other).context(format!("kube request for {}", key))),
    }
}

#[async_trait::async_trait]
impl ObjectStore<DynamicObject> for DynamicStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.api(key)?.get(&key.name).await.map_err(|e| store_error(key, e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(obj).map_err(anyhow::Error::new)?;
        self.api(&key)?
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| store_error(&key, e))
    }
}
