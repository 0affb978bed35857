//! fleetplane public API facade (in-process).
//!
//! Frontends depend on [`FleetApi`]. [`ControlPlane`] implements it over the shared
//! pod and job caches and the leader coordinator. Reads never wait on cluster I/O;
//! deletes go to the live cluster under the caller's identity.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fleetplane_core::{Actor, LabelSelector};
use fleetplane_kubehub::{ClusterBackend, ResourceSpec};
use fleetplane_leader::LeaderCoordinator;
use fleetplane_store::transforms::{transform_job, transform_pod};
use fleetplane_store::{CacheError, CacheOptions, Filters, TypedResourceCache, WatchedObject};

/// Kinds served by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Pod,
    Job,
}

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Pod, Kind::Job];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Pod => "pod",
            Kind::Job => "job",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read scope for list calls. Empty `clusters` means every cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub clusters: Vec<String>,
    /// Label selector in Kubernetes syntax.
    pub labels: Option<String>,
    pub include_deleted: bool,
}

impl Scope {
    fn filters(&self) -> ApiResult<Filters> {
        let mut f = Filters::new();
        for c in &self.clusters {
            f = f.in_cluster(c.clone());
        }
        if let Some(sel) = self.labels.as_deref().filter(|s| !s.trim().is_empty()) {
            let sel = LabelSelector::parse(sel).map_err(|e| ApiError::Validation(e.to_string()))?;
            f = f.with_labels(sel);
        }
        if !self.include_deleted {
            f = f.without_deleted();
        }
        Ok(f)
    }
}

/// An object as served to callers: its address, a few metadata fields and the
/// projected object itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectView {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub deleting: bool,
    pub object: Value,
}

impl ObjectView {
    fn from_watched<T: Serialize>(o: &WatchedObject<T>) -> ApiResult<Self> {
        Ok(Self {
            cluster: o.cluster.clone(),
            namespace: o.namespace.clone(),
            name: o.name.clone(),
            resource_version: o.resource_version.clone(),
            labels: o.labels.iter().cloned().collect(),
            deleting: o.deleting,
            object: serde_json::to_value(&*o.obj).map_err(|e| ApiError::Internal(e.to_string()))?,
        })
    }

    fn from_object<T: Serialize>(cluster: &str, namespace: &str, name: &str, obj: &T) -> ApiResult<Self> {
        let object = serde_json::to_value(obj).map_err(|e| ApiError::Internal(e.to_string()))?;
        let meta = object.get("metadata");
        let labels = meta
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
            .map(|l| l.iter().filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string()))).collect())
            .unwrap_or_default();
        Ok(Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            resource_version: meta.and_then(|m| m.get("resourceVersion")).and_then(Value::as_str).map(str::to_string),
            labels,
            deleting: meta.and_then(|m| m.get("deletionTimestamp")).is_some_and(|v| !v.is_null()),
            object,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster: String,
    pub kind: Kind,
    pub state: String,
    pub objects: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub identity: String,
    pub leader: bool,
    pub clusters: Vec<ClusterStatus>,
}

/// API errors suitable for transport.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::NotFound { .. } | CacheError::UnknownCluster(_) => ApiError::NotFound(e.to_string()),
            CacheError::Unavailable { .. } | CacheError::NotReady(_) => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl ApiError {
    fn label(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Validation(_) => "validation",
            ApiError::Internal(_) => "internal",
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[async_trait::async_trait]
pub trait FleetApi: Send + Sync {
    /// Objects of `kind` in `namespace`, sorted by name.
    async fn list(&self, kind: Kind, namespace: &str, scope: &Scope) -> ApiResult<Vec<ObjectView>>;

    async fn get(&self, kind: Kind, cluster: &str, namespace: &str, name: &str) -> ApiResult<ObjectView>;

    /// Delete on the live cluster as `actor`. Returns once the cache reflects it or
    /// the wait bound has passed.
    async fn delete(&self, kind: Kind, actor: &Actor, cluster: &str, namespace: &str, name: &str) -> ApiResult<()>;

    /// Leadership and per-cluster watch state.
    async fn status(&self) -> ApiResult<Status>;
}

fn observe<T>(op: &'static str, kind: Kind, started: Instant, res: &ApiResult<T>) {
    let outcome = match res {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    histogram!("api_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op, "kind" => kind.as_str());
    counter!("api_requests_total", 1u64, "op" => op, "kind" => kind.as_str(), "outcome" => outcome);
}

/// In-process implementation over the pod and job caches.
pub struct ControlPlane {
    pods: TypedResourceCache<Pod>,
    jobs: TypedResourceCache<Job>,
    leader: Arc<LeaderCoordinator>,
}

impl ControlPlane {
    pub fn new(backends: Vec<Arc<dyn ClusterBackend>>, leader: Arc<LeaderCoordinator>, system_namespace: &str) -> Self {
        let pods = CacheOptions::new(ResourceSpec::of::<Pod>())
            .transformer(transform_pod)
            .system_namespace(system_namespace);
        let jobs = CacheOptions::new(ResourceSpec::of::<Job>())
            .transformer(transform_job)
            .system_namespace(system_namespace);
        Self {
            pods: TypedResourceCache::new(backends.clone(), pods),
            jobs: TypedResourceCache::new(backends, jobs),
            leader,
        }
    }

    /// Start the list+watch tasks of both caches.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.pods.start(cancel.clone());
        handles.extend(self.jobs.start(cancel));
        info!(clusters = self.pods.clusters().len(), "caches started");
        handles
    }

    pub async fn wait_for_ready(&self, timeout: Duration) -> ApiResult<()> {
        self.pods.wait_for_ready(timeout).await?;
        self.jobs.wait_for_ready(timeout).await?;
        Ok(())
    }

    pub fn pods(&self) -> &TypedResourceCache<Pod> {
        &self.pods
    }

    pub fn jobs(&self) -> &TypedResourceCache<Job> {
        &self.jobs
    }

    pub fn leader(&self) -> &Arc<LeaderCoordinator> {
        &self.leader
    }

    fn statuses<T: Send + Sync + 'static>(cache: &TypedResourceCache<T>, kind: Kind, out: &mut Vec<ClusterStatus>) {
        for cluster in cache.clusters() {
            out.push(ClusterStatus {
                kind,
                state: cache.cluster_state(&cluster).map(|s| s.to_string()).unwrap_or_default(),
                objects: cache.get_by_cluster(&cluster, &Filters::new()).len(),
                last_error: cache.cluster_error(&cluster).map(|e| e.to_string()),
                cluster,
            });
        }
    }
}

fn views<T: Serialize>(objs: &[WatchedObject<T>]) -> ApiResult<Vec<ObjectView>> {
    objs.iter().map(ObjectView::from_watched).collect()
}

#[async_trait::async_trait]
impl FleetApi for ControlPlane {
    async fn list(&self, kind: Kind, namespace: &str, scope: &Scope) -> ApiResult<Vec<ObjectView>> {
        let started = Instant::now();
        let res = scope.filters().and_then(|f| match kind {
            Kind::Pod => views(&self.pods.get_by_namespace(namespace, &f)),
            Kind::Job => views(&self.jobs.get_by_namespace(namespace, &f)),
        });
        if let Ok(items) = &res {
            debug!(%kind, namespace, items = items.len(), "api: list");
        }
        observe("list", kind, started, &res);
        res
    }

    async fn get(&self, kind: Kind, cluster: &str, namespace: &str, name: &str) -> ApiResult<ObjectView> {
        let started = Instant::now();
        let res = match kind {
            Kind::Pod => self
                .pods
                .get(cluster, namespace, name)
                .map_err(ApiError::from)
                .and_then(|o| ObjectView::from_object(cluster, namespace, name, &*o)),
            Kind::Job => self
                .jobs
                .get(cluster, namespace, name)
                .map_err(ApiError::from)
                .and_then(|o| ObjectView::from_object(cluster, namespace, name, &*o)),
        };
        observe("get", kind, started, &res);
        res
    }

    async fn delete(&self, kind: Kind, actor: &Actor, cluster: &str, namespace: &str, name: &str) -> ApiResult<()> {
        let started = Instant::now();
        info!(%kind, cluster, namespace, name, user = %actor.user, "api: delete");
        let res = match kind {
            Kind::Pod => self.pods.delete(actor, cluster, namespace, name).await,
            Kind::Job => self.jobs.delete(actor, cluster, namespace, name).await,
        }
        .map_err(ApiError::from);
        observe("delete", kind, started, &res);
        res
    }

    async fn status(&self) -> ApiResult<Status> {
        let mut clusters = Vec::new();
        Self::statuses(&self.pods, Kind::Pod, &mut clusters);
        Self::statuses(&self.jobs, Kind::Job, &mut clusters);
        Ok(Status { identity: self.leader.identity().to_string(), leader: self.leader.is_leader(), clusters })
    }
}
