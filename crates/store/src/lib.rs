//! fleetplane store: typed, multi-cluster caches of watched Kubernetes objects.
//!
//! One [`TypedResourceCache`] exists per watched kind and spans every configured
//! cluster. Each cluster gets its own shard, its own watch task and its own state,
//! so a failing cluster never disturbs reads or writes for the others.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

use fleetplane_core::{LabelSelector, Labels, DEFAULT_SYSTEM_NAMESPACE};
use fleetplane_kubehub::{KubeHubError, ResourceSpec};

mod cache;
pub mod transforms;

pub use cache::TypedResourceCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{kind} {cluster}/{namespace}/{name} not found")]
    NotFound { kind: String, cluster: String, namespace: String, name: String },
    #[error("unknown cluster {0}")]
    UnknownCluster(String),
    #[error("cluster {cluster} unavailable: {source}")]
    Unavailable {
        cluster: String,
        #[source]
        source: KubeHubError,
    },
    #[error("clusters not ready: {0:?}")]
    NotReady(Vec<String>),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

/// Watch state of one cluster within one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Listing (initially or after an error).
    Connecting,
    /// Initial list applied.
    Synced,
    /// Receiving incremental events.
    Watching,
    /// The watch failed; a reconnect is scheduled.
    Error,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Connecting => "connecting",
            ClusterState::Synced => "synced",
            ClusterState::Watching => "watching",
            ClusterState::Error => "error",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached object tagged with where it lives.
#[derive(Debug)]
pub struct WatchedObject<T> {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
    pub labels: Labels,
    /// Set once the object has a deletion timestamp.
    pub deleting: bool,
    pub obj: Arc<T>,
}

impl<T> Clone for WatchedObject<T> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            resource_version: self.resource_version.clone(),
            labels: self.labels.clone(),
            deleting: self.deleting,
            obj: self.obj.clone(),
        }
    }
}

/// Read-time filters for namespace, cluster and fleet wide listings.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    clusters: Vec<String>,
    labels: Option<LabelSelector>,
    without_deleted: bool,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a cluster. Repeatable; the union of the named clusters is kept.
    pub fn in_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.clusters.push(cluster.into());
        self
    }

    pub fn with_labels(mut self, selector: LabelSelector) -> Self {
        self.labels = Some(selector);
        self
    }

    /// Skip objects that carry a deletion timestamp.
    pub fn without_deleted(mut self) -> Self {
        self.without_deleted = true;
        self
    }

    pub(crate) fn admits_cluster(&self, cluster: &str) -> bool {
        self.clusters.is_empty() || self.clusters.iter().any(|c| c == cluster)
    }

    pub(crate) fn admits<T>(&self, o: &WatchedObject<T>) -> bool {
        if self.without_deleted && o.deleting {
            return false;
        }
        self.labels.as_ref().map_or(true, |s| s.matches(&o.labels))
    }
}

/// Raw-object rewrite applied before conversion.
pub type Transformer = Arc<dyn Fn(serde_json::Value) -> anyhow::Result<serde_json::Value> + Send + Sync>;
/// Raw object plus cluster name to domain type. `None` drops the object.
pub type Converter<T> = Arc<dyn Fn(&serde_json::Value, &str) -> Option<T> + Send + Sync>;
pub type ObjectHook<T> = Arc<dyn Fn(&WatchedObject<T>) + Send + Sync>;
pub type UpdateHook<T> = Arc<dyn Fn(&WatchedObject<T>, &WatchedObject<T>) + Send + Sync>;

/// Construction options for a [`TypedResourceCache`].
pub struct CacheOptions<T> {
    pub(crate) resource: ResourceSpec,
    pub(crate) converter: Converter<T>,
    pub(crate) transformer: Option<Transformer>,
    pub(crate) informer_filter: Option<LabelSelector>,
    pub(crate) system_namespace: String,
    pub(crate) delete_wait: Duration,
    pub(crate) on_add: Vec<ObjectHook<T>>,
    pub(crate) on_update: Vec<UpdateHook<T>>,
    pub(crate) on_remove: Vec<ObjectHook<T>>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> CacheOptions<T> {
    /// Objects are deserialized straight into `T`.
    pub fn new(resource: ResourceSpec) -> Self {
        Self::with_converter(resource, |raw, _cluster| serde_json::from_value(raw.clone()).ok())
    }
}

impl<T: Send + Sync + 'static> CacheOptions<T> {
    pub fn with_converter<F>(resource: ResourceSpec, converter: F) -> Self
    where
        F: Fn(&serde_json::Value, &str) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            resource,
            converter: Arc::new(converter),
            transformer: None,
            informer_filter: None,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            delete_wait: Duration::from_secs(5),
            on_add: Vec::new(),
            on_update: Vec::new(),
            on_remove: Vec::new(),
        }
    }

    pub fn transformer<F>(mut self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.transformer = Some(Arc::new(f));
        self
    }

    /// Server-side label selector for the list+watch.
    pub fn with_informer_filter(mut self, selector: LabelSelector) -> Self {
        self.informer_filter = if selector.is_everything() { None } else { Some(selector) };
        self
    }

    pub fn system_namespace(mut self, ns: impl Into<String>) -> Self {
        self.system_namespace = ns.into();
        self
    }

    /// Upper bound for [`TypedResourceCache::delete`] to wait for the watch to retire the object.
    pub fn delete_wait(mut self, d: Duration) -> Self {
        self.delete_wait = d;
        self
    }

    pub fn on_add(mut self, f: impl Fn(&WatchedObject<T>) + Send + Sync + 'static) -> Self {
        self.on_add.push(Arc::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&WatchedObject<T>, &WatchedObject<T>) + Send + Sync + 'static) -> Self {
        self.on_update.push(Arc::new(f));
        self
    }

    pub fn on_remove(mut self, f: impl Fn(&WatchedObject<T>) + Send + Sync + 'static) -> Self {
        self.on_remove.push(Arc::new(f));
        self
    }
}

/// Optional overrides for [`TypedResourceCache::impersonated_client`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Act on another group/version/resource than the cached one.
    pub resource: Option<ResourceSpec>,
}

impl ClientOptions {
    pub fn resource(resource: ResourceSpec) -> Self {
        Self { resource: Some(resource) }
    }
}
