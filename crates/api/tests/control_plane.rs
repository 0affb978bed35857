#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use fleetplane_api::{ApiError, ControlPlane, FleetApi, Kind, Scope};
use fleetplane_core::Actor;
use fleetplane_kubehub::{ClusterBackend, KubeHubError, ResourceSpec, ScopedClient, WatchEvent, WatchParams, WatchStream};
use fleetplane_leader::{ElectionParams, LeaderCoordinator, MemoryLeaseStore};

type Item = Result<WatchEvent, KubeHubError>;

/// One watch channel per resource, fed by the test.
struct FakeCluster {
    name: String,
    senders: Mutex<HashMap<String, UnboundedSender<Item>>>,
    receivers: Mutex<HashMap<String, UnboundedReceiver<Item>>>,
    deletes: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn new(name: &str) -> Arc<Self> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for gvr in ["v1/pods", "batch/v1/jobs"] {
            let (tx, rx) = unbounded();
            senders.insert(gvr.to_string(), tx);
            receivers.insert(gvr.to_string(), rx);
        }
        Arc::new(Self {
            name: name.into(),
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
            deletes: Mutex::new(Vec::new()),
        })
    }

    fn send(&self, gvr: &str, ev: WatchEvent) {
        self.senders.lock().unwrap()[gvr].unbounded_send(Ok(ev)).unwrap();
    }
}

#[async_trait]
impl ClusterBackend for FakeCluster {
    fn cluster(&self) -> &str {
        &self.name
    }

    fn watch(&self, resource: &ResourceSpec, _params: &WatchParams) -> WatchStream {
        match self.receivers.lock().unwrap().remove(&resource.gvr()) {
            Some(rx) => rx.boxed(),
            None => futures::stream::pending().boxed(),
        }
    }

    async fn delete(&self, resource: &ResourceSpec, _actor: &Actor, namespace: &str, name: &str) -> Result<(), KubeHubError> {
        let gvr = resource.gvr();
        self.deletes.lock().unwrap().push(format!("{gvr}:{namespace}/{name}"));
        let obj = json!({"metadata": {"name": name, "namespace": namespace}});
        let _ = self.senders.lock().unwrap()[&gvr].unbounded_send(Ok(WatchEvent::Deleted(obj)));
        Ok(())
    }

    fn impersonated(&self, _: &ResourceSpec, _: &Actor) -> Result<ScopedClient, KubeHubError> {
        Err(KubeHubError::Unavailable(self.name.clone()))
    }

    fn system(&self, _: &ResourceSpec) -> Result<ScopedClient, KubeHubError> {
        Err(KubeHubError::Unavailable(self.name.clone()))
    }
}

fn pod(namespace: &str, name: &str, app: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": "3",
            "labels": {"app": app, "pod-template-hash": "abc"},
            "annotations": {"noise": "yes"}
        },
        "spec": {"nodeName": "n1", "containers": [{"name": app, "image": format!("ghcr.io/acme/{app}:1")}]},
        "status": {"phase": "Running"}
    })
}

fn job(namespace: &str, name: &str) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": name, "namespace": namespace, "labels": {"app": name}},
        "spec": {"template": {"spec": {"containers": [{"name": "main", "image": "busybox"}]}}},
        "status": {"succeeded": 1}
    })
}

async fn plane(clusters: &[Arc<FakeCluster>]) -> (ControlPlane, CancellationToken) {
    let leader = LeaderCoordinator::new("replica-a", Arc::new(MemoryLeaseStore::new()), ElectionParams::default());
    let backends = clusters.iter().map(|c| c.clone() as Arc<dyn ClusterBackend>).collect();
    let cp = ControlPlane::new(backends, leader, "nais-system");
    let cancel = CancellationToken::new();
    cp.start(cancel.clone());
    (cp, cancel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lists_span_clusters_and_honour_scope() {
    let (a, b) = (FakeCluster::new("dev"), FakeCluster::new("prod"));
    let (cp, cancel) = plane(&[a.clone(), b.clone()]).await;
    a.send("v1/pods", WatchEvent::Restarted(vec![pod("team", "web-1", "web"), pod("nais-system", "elector", "elector")]));
    b.send("v1/pods", WatchEvent::Restarted(vec![pod("team", "api-1", "api"), pod("team", "web-2", "web")]));
    a.send("batch/v1/jobs", WatchEvent::Restarted(vec![job("team", "nightly")]));
    b.send("batch/v1/jobs", WatchEvent::Restarted(vec![]));
    cp.wait_for_ready(Duration::from_secs(2)).await.unwrap();

    let all = cp.list(Kind::Pod, "team", &Scope::default()).await.unwrap();
    let names: Vec<_> = all.iter().map(|v| format!("{}/{}", v.cluster, v.name)).collect();
    assert_eq!(names, vec!["prod/api-1", "dev/web-1", "prod/web-2"]);
    // projections drop what the platform does not read
    assert!(all[0].object["metadata"].get("annotations").is_none());
    assert_eq!(all[0].labels.get("app").map(String::as_str), Some("api"));

    let scoped = Scope { clusters: vec!["prod".into()], labels: Some("app=web".into()), include_deleted: false };
    let web = cp.list(Kind::Pod, "team", &scoped).await.unwrap();
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].name, "web-2");

    let jobs = cp.list(Kind::Job, "team", &Scope::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].object["spec"]["template"]["spec"]["containers"][0]["image"], "busybox");
    assert!(cp.list(Kind::Pod, "nais-system", &Scope::default()).await.unwrap().is_empty());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gets_and_deletes_are_typed() {
    let a = FakeCluster::new("dev");
    let (cp, cancel) = plane(&[a.clone()]).await;
    a.send("v1/pods", WatchEvent::Restarted(vec![pod("team", "web-1", "web")]));
    a.send("batch/v1/jobs", WatchEvent::Restarted(vec![]));
    cp.wait_for_ready(Duration::from_secs(2)).await.unwrap();

    let got = cp.get(Kind::Pod, "dev", "team", "web-1").await.unwrap();
    assert_eq!(got.resource_version.as_deref(), Some("3"));
    assert!(matches!(cp.get(Kind::Pod, "dev", "team", "nope").await, Err(ApiError::NotFound(_))));
    assert!(matches!(cp.get(Kind::Job, "elsewhere", "team", "x").await, Err(ApiError::NotFound(_))));

    let actor = Actor::new("dev@example.com", vec!["team".into()]);
    cp.delete(Kind::Pod, &actor, "dev", "team", "web-1").await.unwrap();
    assert!(matches!(cp.get(Kind::Pod, "dev", "team", "web-1").await, Err(ApiError::NotFound(_))));
    assert_eq!(*a.deletes.lock().unwrap(), vec!["v1/pods:team/web-1".to_string()]);

    let status = cp.status().await.unwrap();
    assert!(!status.leader);
    assert_eq!(status.identity, "replica-a");
    assert_eq!(status.clusters.len(), 2);
    assert!(status.clusters.iter().all(|c| c.cluster == "dev" && c.last_error.is_none()));
    cancel.cancel();
}
