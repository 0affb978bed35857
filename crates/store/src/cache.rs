use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetplane_core::{Actor, Labels};
use fleetplane_kubehub::{ClusterBackend, ScopedClient, WatchEvent, WatchParams};

use crate::{CacheError, CacheOptions, ClientOptions, ClusterState, Filters, WatchedObject};

type Key = (String, String);

struct Shard<T> {
    cluster: String,
    backend: Arc<dyn ClusterBackend>,
    objects: RwLock<FxHashMap<Key, WatchedObject<T>>>,
    state: watch::Sender<ClusterState>,
    /// Flips to true after the first successful list and stays there.
    ready: watch::Sender<bool>,
    last_error: ArcSwapOption<String>,
}

impl<T> Shard<T> {
    fn lookup(&self, namespace: &str, name: &str) -> Option<WatchedObject<T>> {
        let map = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    fn collect(&self, filters: &Filters, namespace: Option<&str>, out: &mut Vec<WatchedObject<T>>) {
        let map = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        out.extend(
            map.values()
                .filter(|o| namespace.map_or(true, |ns| o.namespace == ns))
                .filter(|o| filters.admits(o))
                .cloned(),
        );
    }

    fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn set_state(&self, state: ClusterState) {
        self.state.send_if_modified(|s| {
            if *s == state {
                return false;
            }
            *s = state;
            true
        });
    }
}

struct Meta {
    namespace: String,
    name: String,
    resource_version: Option<String>,
    labels: Labels,
    deleting: bool,
}

impl Meta {
    fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name")?.as_str()?.to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(str::to_string);
        let mut labels: Labels = meta
            .get("labels")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
            .unwrap_or_default();
        labels.sort();
        let deleting = meta.get("deletionTimestamp").map_or(false, |v| !v.is_null());
        Some(Self { namespace, name, resource_version, labels, deleting })
    }
}

struct Inner<T> {
    opts: CacheOptions<T>,
    gvr: String,
    /// Sorted by cluster name.
    shards: Vec<Arc<Shard<T>>>,
    epoch: watch::Sender<u64>,
}

/// Cache of one resource kind across every configured cluster.
///
/// Readers get `Arc`-shared objects and never wait on cluster I/O.
pub struct TypedResourceCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TypedResourceCache<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

fn watch_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(800))
        .with_max_interval(Duration::from_secs(30))
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build()
}

enum Change<T> {
    Added(WatchedObject<T>),
    Updated(WatchedObject<T>, WatchedObject<T>),
    Removed(WatchedObject<T>),
}

impl<T: Send + Sync + 'static> TypedResourceCache<T> {
    pub fn new(backends: Vec<Arc<dyn ClusterBackend>>, opts: CacheOptions<T>) -> Self {
        let mut shards: Vec<Arc<Shard<T>>> = backends
            .into_iter()
            .map(|backend| {
                Arc::new(Shard {
                    cluster: backend.cluster().to_string(),
                    backend,
                    objects: RwLock::new(FxHashMap::default()),
                    state: watch::channel(ClusterState::Connecting).0,
                    ready: watch::channel(false).0,
                    last_error: ArcSwapOption::empty(),
                })
            })
            .collect();
        shards.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        let gvr = opts.resource.gvr();
        Self { inner: Arc::new(Inner { opts, gvr, shards, epoch: watch::channel(0).0 }) }
    }

    /// Spawn one list+watch task per cluster. Tasks stop when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.inner
            .shards
            .iter()
            .map(|shard| {
                let this = self.clone();
                let shard = shard.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { this.run_cluster(shard, cancel).await })
            })
            .collect()
    }

    pub fn clusters(&self) -> Vec<String> {
        self.inner.shards.iter().map(|s| s.cluster.clone()).collect()
    }

    pub fn gvr(&self) -> &str {
        &self.inner.gvr
    }

    fn kind(&self) -> &str {
        &self.inner.opts.resource.api_resource.kind
    }

    fn shard(&self, cluster: &str) -> Result<&Arc<Shard<T>>, CacheError> {
        self.inner
            .shards
            .iter()
            .find(|s| s.cluster == cluster)
            .ok_or_else(|| CacheError::UnknownCluster(cluster.to_string()))
    }

    pub fn get(&self, cluster: &str, namespace: &str, name: &str) -> Result<Arc<T>, CacheError> {
        self.shard(cluster)?.lookup(namespace, name).map(|o| o.obj).ok_or_else(|| CacheError::NotFound {
            kind: self.kind().to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Objects in `namespace` across the admitted clusters, sorted by name.
    pub fn get_by_namespace(&self, namespace: &str, filters: &Filters) -> Vec<WatchedObject<T>> {
        self.list(Some(namespace), filters)
    }

    /// Objects in one cluster, sorted by name. Unknown clusters yield nothing.
    pub fn get_by_cluster(&self, cluster: &str, filters: &Filters) -> Vec<WatchedObject<T>> {
        let mut out = Vec::new();
        if let Ok(shard) = self.shard(cluster) {
            shard.collect(filters, None, &mut out);
        }
        sort_by_name(&mut out);
        out
    }

    pub fn all(&self) -> Vec<WatchedObject<T>> {
        self.list(None, &Filters::default())
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list(&self, namespace: Option<&str>, filters: &Filters) -> Vec<WatchedObject<T>> {
        let mut out = Vec::new();
        for shard in self.inner.shards.iter().filter(|s| filters.admits_cluster(&s.cluster)) {
            shard.collect(filters, namespace, &mut out);
        }
        sort_by_name(&mut out);
        out
    }

    pub fn cluster_state(&self, cluster: &str) -> Option<ClusterState> {
        self.shard(cluster).ok().map(|s| *s.state.borrow())
    }

    /// Last watch error of a cluster, cleared by the next successful list.
    pub fn cluster_error(&self, cluster: &str) -> Option<Arc<String>> {
        self.shard(cluster).ok().and_then(|s| s.last_error.load_full())
    }

    /// Wait until every cluster has completed its first list.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), CacheError> {
        let waits = self.inner.shards.iter().map(|s| {
            let mut rx = s.ready.subscribe();
            async move {
                let _ = rx.wait_for(|ready| *ready).await;
            }
        });
        if tokio::time::timeout(timeout, futures::future::join_all(waits)).await.is_ok() {
            return Ok(());
        }
        let pending = self.inner.shards.iter().filter(|s| !*s.ready.borrow()).map(|s| s.cluster.clone()).collect();
        Err(CacheError::NotReady(pending))
    }

    /// Delete on the live cluster as `actor`, then wait (bounded) until the watch has
    /// retired the entry or marked it as deleting.
    pub async fn delete(&self, actor: &Actor, cluster: &str, namespace: &str, name: &str) -> Result<(), CacheError> {
        let shard = self.shard(cluster)?;
        let mut epoch = self.inner.epoch.subscribe();
        shard.backend.delete(&self.inner.opts.resource, actor, namespace, name).await.map_err(|e| {
            if e.is_not_found() {
                CacheError::NotFound {
                    kind: self.kind().to_string(),
                    cluster: cluster.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            } else {
                CacheError::Unavailable { cluster: cluster.to_string(), source: e }
            }
        })?;
        let retired = async {
            loop {
                if shard.lookup(namespace, name).map_or(true, |o| o.deleting) {
                    return;
                }
                if epoch.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(self.inner.opts.delete_wait, retired).await.is_err() {
            warn!(%cluster, %namespace, %name, gvr = %self.inner.gvr, "deleted object still cached after wait");
        }
        Ok(())
    }

    /// Client acting as `actor` against one cluster, optionally for another resource.
    pub fn impersonated_client(&self, actor: &Actor, cluster: &str, opts: ClientOptions) -> Result<ScopedClient, CacheError> {
        let shard = self.shard(cluster)?;
        let resource = opts.resource.unwrap_or_else(|| self.inner.opts.resource.clone());
        shard
            .backend
            .impersonated(&resource, actor)
            .map_err(|source| CacheError::Unavailable { cluster: cluster.to_string(), source })
    }

    /// Client acting as the service account, for actions not attributable to a user.
    pub fn system_client(&self, cluster: &str, opts: ClientOptions) -> Result<ScopedClient, CacheError> {
        let shard = self.shard(cluster)?;
        let resource = opts.resource.unwrap_or_else(|| self.inner.opts.resource.clone());
        shard.backend.system(&resource).map_err(|source| CacheError::Unavailable { cluster: cluster.to_string(), source })
    }

    async fn run_cluster(&self, shard: Arc<Shard<T>>, cancel: CancellationToken) {
        let params = WatchParams {
            label_selector: self.inner.opts.informer_filter.as_ref().map(|s| s.as_str().to_string()),
            field_selector: None,
        };
        let mut backoff = watch_backoff();
        info!(cluster = %shard.cluster, gvr = %self.inner.gvr, "watch started");
        loop {
            shard.set_state(ClusterState::Connecting);
            let mut stream = shard.backend.watch(&self.inner.opts.resource, &params);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(cluster = %shard.cluster, gvr = %self.inner.gvr, "watch stopped");
                        return;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(ev)) => {
                        if matches!(ev, WatchEvent::Restarted(_)) {
                            backoff.reset();
                            shard.last_error.store(None);
                        }
                        self.apply(&shard, ev);
                    }
                    Some(Err(e)) => {
                        warn!(cluster = %shard.cluster, gvr = %self.inner.gvr, error = %e, "watch failed");
                        shard.last_error.store(Some(Arc::new(e.to_string())));
                        break;
                    }
                    None => {
                        warn!(cluster = %shard.cluster, gvr = %self.inner.gvr, "watch stream ended");
                        break;
                    }
                }
            }
            shard.set_state(ClusterState::Error);
            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
            debug!(cluster = %shard.cluster, gvr = %self.inner.gvr, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn build(&self, cluster: &str, raw: serde_json::Value) -> Option<WatchedObject<T>> {
        let opts = &self.inner.opts;
        let raw = match &opts.transformer {
            Some(t) => match t(raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(%cluster, gvr = %self.inner.gvr, error = %e, "transform failed; object dropped");
                    return None;
                }
            },
            None => raw,
        };
        let meta = Meta::from_raw(&raw)?;
        if meta.namespace == opts.system_namespace {
            return None;
        }
        let Some(obj) = (opts.converter)(&raw, cluster) else {
            warn!(%cluster, namespace = %meta.namespace, name = %meta.name, gvr = %self.inner.gvr, "conversion failed; object dropped");
            return None;
        };
        Some(WatchedObject {
            cluster: cluster.to_string(),
            namespace: meta.namespace,
            name: meta.name,
            resource_version: meta.resource_version,
            labels: meta.labels,
            deleting: meta.deleting,
            obj: Arc::new(obj),
        })
    }

    fn apply(&self, shard: &Shard<T>, ev: WatchEvent) {
        let cluster = shard.cluster.as_str();
        let mut changes = Vec::new();
        match ev {
            WatchEvent::Applied(raw) => {
                let key = Meta::from_raw(&raw).map(|m| (m.namespace, m.name));
                match self.build(cluster, raw) {
                    Some(obj) => {
                        let key = (obj.namespace.clone(), obj.name.clone());
                        let prev = {
                            let mut map = shard.objects.write().unwrap_or_else(PoisonError::into_inner);
                            map.insert(key, obj.clone())
                        };
                        changes.push(match prev {
                            Some(prev) => Change::Updated(prev, obj),
                            None => Change::Added(obj),
                        });
                    }
                    // an older version must not outlive an update we could not read
                    None => {
                        let prev = key.and_then(|k| {
                            let mut map = shard.objects.write().unwrap_or_else(PoisonError::into_inner);
                            map.remove(&k)
                        });
                        if let Some(prev) = prev {
                            warn!(%cluster, namespace = %prev.namespace, name = %prev.name, gvr = %self.inner.gvr, "unreadable update; cached version evicted");
                            changes.push(Change::Removed(prev));
                        }
                    }
                }
                if *shard.state.borrow() == ClusterState::Synced {
                    shard.set_state(ClusterState::Watching);
                }
            }
            WatchEvent::Deleted(raw) => {
                if let Some(meta) = Meta::from_raw(&raw) {
                    let prev = {
                        let mut map = shard.objects.write().unwrap_or_else(PoisonError::into_inner);
                        map.remove(&(meta.namespace, meta.name))
                    };
                    changes.extend(prev.map(Change::Removed));
                }
                if *shard.state.borrow() == ClusterState::Synced {
                    shard.set_state(ClusterState::Watching);
                }
            }
            WatchEvent::Restarted(list) => {
                let mut fresh = FxHashMap::default();
                for raw in list {
                    if let Some(obj) = self.build(cluster, raw) {
                        fresh.insert((obj.namespace.clone(), obj.name.clone()), obj);
                    }
                }
                {
                    let mut map = shard.objects.write().unwrap_or_else(PoisonError::into_inner);
                    let old = std::mem::replace(&mut *map, fresh);
                    for (k, obj) in map.iter() {
                        match old.get(k) {
                            None => changes.push(Change::Added(obj.clone())),
                            Some(prev) if prev.resource_version != obj.resource_version => {
                                changes.push(Change::Updated(prev.clone(), obj.clone()))
                            }
                            Some(_) => {}
                        }
                    }
                    // entries whose delete we never saw
                    changes.extend(old.into_iter().filter(|(k, _)| !map.contains_key(k)).map(|(_, o)| Change::Removed(o)));
                }
                shard.set_state(ClusterState::Synced);
                shard.ready.send_replace(true);
                debug!(%cluster, gvr = %self.inner.gvr, count = shard.len(), "cluster synced");
            }
        }
        self.dispatch(changes);
        gauge!("watcher_resources", shard.len() as f64, "gvr" => self.inner.gvr.clone(), "cluster" => cluster.to_string());
        self.inner.epoch.send_modify(|e| *e += 1);
    }

    fn dispatch(&self, changes: Vec<Change<T>>) {
        let opts = &self.inner.opts;
        for change in changes {
            let action = match &change {
                Change::Added(o) => {
                    opts.on_add.iter().for_each(|h| h(o));
                    "add"
                }
                Change::Updated(prev, o) => {
                    opts.on_update.iter().for_each(|h| h(prev, o));
                    "update"
                }
                Change::Removed(o) => {
                    opts.on_remove.iter().for_each(|h| h(o));
                    "remove"
                }
            };
            counter!("watcher_events_total", 1u64, "gvr" => self.inner.gvr.clone(), "action" => action);
        }
    }
}

fn sort_by_name<T>(v: &mut [WatchedObject<T>]) {
    v.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.cluster.cmp(&b.cluster)).then_with(|| a.namespace.cmp(&b.namespace)));
}
