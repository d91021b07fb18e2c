#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tikvop_controller::{
    guaranteed_update, run_workers, tikv_cluster_gvk, watch_for_controller, watch_for_object, ControllerConfig,
    Reconciler, RetryPolicy, UpdateOutcome,
};
use tikvop_core::{ignore_error, requeue_error, ErrorReporter, LogReporter, ObjectKey};
use tikvop_kubehub::{dynamic_api, start_watcher, DynamicStore};
use tikvop_store::{spawn_ingest, DedupQueue, Informer};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tikvopctl", version, about = "TiKV operator controller core")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to operate in (default: all namespaces)
    #[arg(long = "ns", global = true, env = "TIKVOP_NAMESPACE")]
    namespace: Option<String>,

    /// Conflict retries for guaranteed updates
    #[arg(long = "update-retries", global = true, env = "TIKVOP_UPDATE_RETRIES", default_value_t = 4)]
    update_retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch TikvClusters and their StatefulSets/Services and reconcile them
    Watch {
        /// Concurrent reconcile workers
        #[arg(long = "workers", env = "TIKVOP_WORKERS", default_value_t = 5)]
        workers: usize,
        /// Full cache re-delivery period in seconds (0 disables)
        #[arg(long = "resync-secs", env = "TIKVOP_RESYNC_SECS", default_value_t = 30)]
        resync_secs: u64,
        /// Delay before a requeued key is retried, in milliseconds
        #[arg(long = "requeue-ms", env = "TIKVOP_REQUEUE_MS", default_value_t = 1000)]
        requeue_ms: u64,
        /// Route every owned child, not only operator-managed ones
        #[arg(long = "all-children", action = ArgAction::SetTrue)]
        all_children: bool,
    },
    /// Set one annotation on a TikvCluster, writing only if it changes
    Annotate {
        /// TikvCluster name
        name: String,
        /// Annotation as key=value
        annotation: String,
    },
}

fn init_tracing() {
    let env = std::env::var("TIKVOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TIKVOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TIKVOP_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    /// Settings for the selected command; flags not taken by it keep their defaults.
    fn config(&self) -> ControllerConfig {
        let mut cfg = ControllerConfig {
            namespace: self.namespace.clone(),
            update_retry: RetryPolicy { max_retries: self.update_retries, ..RetryPolicy::default() },
            ..ControllerConfig::default()
        };
        if let Commands::Watch { workers, resync_secs, requeue_ms, all_children } = &self.command {
            cfg.workers = *workers;
            cfg.resync = (*resync_secs > 0).then(|| Duration::from_secs(*resync_secs));
            cfg.requeue_delay = Duration::from_millis(*requeue_ms);
            if *all_children {
                cfg.child_selector = None;
            }
        }
        cfg
    }
}

fn parse_annotation(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(anyhow!("invalid annotation {:?} (expect key=value)", s)),
    }
}

fn gvk_key() -> String {
    let gvk = tikv_cluster_gvk();
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

/// Feed `informer` from a list+watch on `api`.
fn spawn_feed<K>(informer: Arc<Informer<K>>, api: Api<K>, kind: &str, resync: Option<Duration>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(256);
    let kind = kind.to_string();
    tokio::spawn(async move {
        if let Err(e) = start_watcher(api, &kind, watcher::Config::default(), tx).await {
            error!(kind = %kind, error = %e, "watcher failed");
        }
    });
    spawn_ingest(informer, rx, resync);
}

fn typed_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Logs what the caches hold for each TikvCluster it is handed.
struct LoggingReconciler {
    clusters: Arc<Informer<DynamicObject>>,
    statefulsets: Arc<Informer<StatefulSet>>,
    services: Arc<Informer<Service>>,
}

impl LoggingReconciler {
    fn owned_by<K: Resource>(child: &K, uid: &str) -> bool {
        child.owner_references().iter().any(|r| r.controller == Some(true) && r.uid == uid)
    }
}

#[async_trait::async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        if !self.clusters.has_synced() {
            return Err(requeue_error!("cluster cache not synced yet"));
        }
        let Some(tc) = self.clusters.get(key.namespace.as_deref(), &key.name) else {
            return Err(ignore_error!("TikvCluster {} has been deleted", key));
        };
        let uid = tc.metadata.uid.as_deref().unwrap_or_default();
        let statefulsets = self.statefulsets.list().into_iter().filter(|s| Self::owned_by(&**s, uid)).count();
        let services = self.services.list().into_iter().filter(|s| Self::owned_by(&**s, uid)).count();
        info!(
            key = %key,
            resource_version = tc.metadata.resource_version.as_deref().unwrap_or(""),
            statefulsets,
            services,
            "reconciled"
        );
        Ok(())
    }
}

async fn run_watch(client: Client, cfg: ControllerConfig) -> Result<()> {
    let store = DynamicStore::discover(client.clone(), &gvk_key()).await.context("is the TikvCluster CRD installed?")?;
    let ns = cfg.namespace.as_deref();
    let queue = DedupQueue::new();
    let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);

    let clusters = Informer::<DynamicObject>::new();
    let statefulsets = Informer::<StatefulSet>::new();
    let services = Informer::<Service>::new();

    watch_for_object(&*clusters, Arc::clone(&queue), Arc::clone(&reporter));
    watch_for_controller(
        &*statefulsets,
        Arc::clone(&queue),
        clusters.lister(),
        cfg.child_selector.clone(),
        Arc::clone(&reporter),
    );
    watch_for_controller(&*services, Arc::clone(&queue), clusters.lister(), cfg.child_selector.clone(), reporter);

    let ar = store.api_resource();
    spawn_feed(Arc::clone(&clusters), dynamic_api(client.clone(), ar, store.namespaced(), ns), &ar.kind, cfg.resync);
    spawn_feed(Arc::clone(&statefulsets), typed_api(client.clone(), ns), "StatefulSet", cfg.resync);
    spawn_feed(Arc::clone(&services), typed_api(client, ns), "Service", cfg.resync);

    let reconciler = Arc::new(LoggingReconciler { clusters, statefulsets, services });
    let workers = run_workers(Arc::clone(&queue), reconciler, cfg.workers, cfg.requeue_delay);
    info!(workers = cfg.workers, namespace = ns.unwrap_or("<all>"), "controller running; ctrl-c to stop");

    signal::ctrl_c().await?;
    info!("shutting down");
    queue.shut_down();
    for w in workers {
        if let Err(e) = w.await {
            warn!(error = %e, "worker task failed");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct AnnotateResult<'a> {
    name: &'a str,
    key: &'a str,
    written: bool,
    resource_version: Option<&'a str>,
}

async fn run_annotate(client: Client, output: Output, cfg: &ControllerConfig, name: &str, annotation: &str) -> Result<()> {
    let (key, value) = parse_annotation(annotation)?;
    let ns = cfg.namespace.as_deref().ok_or_else(|| anyhow!("--ns is required for annotate"))?;
    let store = DynamicStore::discover(client, &gvk_key()).await?;
    let mut tc = DynamicObject::new(name, store.api_resource()).within(ns);
    let outcome = guaranteed_update(&store, &mut tc, &cfg.update_retry, |tc: &mut DynamicObject| {
        tc.metadata.annotations.get_or_insert_with(Default::default).insert(key.clone(), value.clone());
        Ok(())
    })
    .await?;
    let written = outcome == UpdateOutcome::Updated;
    match output {
        Output::Human => {
            let verb = if written { "annotated" } else { "unchanged" };
            println!("{}/{} {}", ns, name, verb);
        }
        Output::Json => {
            let res = AnnotateResult {
                name,
                key: &key,
                written,
                resource_version: tc.metadata.resource_version.as_deref(),
            };
            println!("{}", serde_json::to_string_pretty(&res)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.config();
    let client = tikvop_kubehub::client().await?;

    match &cli.command {
        Commands::Watch { .. } => {
            info!(?cfg, "watch invoked");
            run_watch(client, cfg).await
        }
        Commands::Annotate { name, annotation } => {
            info!(name = %name, "annotate invoked");
            run_annotate(client, cli.output, &cfg, name, annotation).await
        }
    }
}
