//! fleetplane kubehub: cluster client sets and list+watch wiring.
//!
//! Everything above this crate talks to a cluster through [`ClusterBackend`], so
//! caches and ingesters can be driven by an in-memory backend in tests.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{ApiResource, GroupVersionKind};
use kube::Resource;
use thiserror::Error;

use fleetplane_core::Actor;

mod clients;
mod impersonate;

pub use clients::{ClusterClientSet, ClusterSource, StaticCluster};
pub use impersonate::{impersonated_config, Identity, ImpersonatedWriteClient, ScopedClient};

#[derive(Debug, Error)]
pub enum KubeHubError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("watch: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),
    #[error("invalid cluster config: {0}")]
    InvalidConfig(String),
    #[error("serializing object: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cluster {0} does not accept writes")]
    Unavailable(String),
}

impl KubeHubError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeHubError::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}

/// Group/version/kind plus plural of a watched or written resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub api_resource: ApiResource,
}

impl ResourceSpec {
    /// Resource spec for a statically typed k8s-openapi kind.
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self { api_resource: ApiResource::erase::<K>(&()) }
    }

    /// Resource spec for a custom resource (no discovery round-trip).
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self { api_resource: ApiResource::from_gvk_with_plural(&gvk, plural) }
    }

    /// `group/version/plural`, or `version/plural` for the core group.
    pub fn gvr(&self) -> String {
        let ar = &self.api_resource;
        if ar.group.is_empty() {
            format!("{}/{}", ar.version, ar.plural)
        } else {
            format!("{}/{}/{}", ar.group, ar.version, ar.plural)
        }
    }
}

/// Server-side filters for a list+watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchParams {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl WatchParams {
    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// Raw watch event. Objects are kept as JSON until the cache converts them.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object added or modified.
    Applied(serde_json::Value),
    Deleted(serde_json::Value),
    /// A full (re)list completed; the list replaces everything seen before.
    Restarted(Vec<serde_json::Value>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, KubeHubError>>;

/// One cluster as seen by caches and ingesters.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn cluster(&self) -> &str;

    /// Start a fresh list+watch. The stream never ends on its own; errors are yielded
    /// and the caller decides whether to reconnect.
    fn watch(&self, resource: &ResourceSpec, params: &WatchParams) -> WatchStream;

    /// Delete an object on the live cluster as `actor`.
    async fn delete(&self, resource: &ResourceSpec, actor: &Actor, namespace: &str, name: &str) -> Result<(), KubeHubError>;

    /// Client acting as `actor` for one resource.
    fn impersonated(&self, resource: &ResourceSpec, actor: &Actor) -> Result<ScopedClient, KubeHubError>;

    /// Client acting as the service's own identity.
    fn system(&self, resource: &ResourceSpec) -> Result<ScopedClient, KubeHubError>;
}

/// Pull `metadata.<field>` as a string out of a raw object.
pub fn meta_str<'a>(raw: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

pub(crate) fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
