//! Kubernetes event ingestion.
//!
//! While this replica leads, every cluster gets one Events.v1 watch per classifier,
//! filtered server-side on the classifier's reason. Matching notes become
//! [`EventFact`]s and are flushed to the store in small periodic batches.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::events::v1::Event;
use metrics::counter;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetplane_core::{EventFact, DEFAULT_SYSTEM_NAMESPACE};
use fleetplane_kubehub::{meta_str, ClusterBackend, ResourceSpec, WatchEvent, WatchParams};
use fleetplane_leader::LeaderCoordinator;
use fleetplane_persist::EventStore;

pub const EVENT_CHANNEL_CAPACITY: usize = 20;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Turns the free-text note of an event into structured data.
pub trait NoteClassifier: Send + Sync {
    /// Event reason this classifier understands. Used as the server-side filter.
    fn reason(&self) -> &'static str;

    fn classify(&self, note: &str) -> Option<Map<String, Value>>;
}

/// `SuccessfulRescale` notes from the horizontal pod autoscaler.
pub struct HpaRescaleClassifier {
    re: Regex,
}

impl HpaRescaleClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self { re: Regex::new(r"New size: (\d+); reason: (\w+).*(below|above) target")? })
    }
}

impl NoteClassifier for HpaRescaleClassifier {
    fn reason(&self) -> &'static str {
        "SuccessfulRescale"
    }

    fn classify(&self, note: &str) -> Option<Map<String, Value>> {
        let caps = self.re.captures(note)?;
        let target = caps.get(3)?.as_str();
        let direction = match target {
            "below" => "down",
            "above" => "up",
            _ => "unknown",
        };
        let mut data = Map::new();
        data.insert("newSize".into(), Value::String(caps.get(1)?.as_str().to_string()));
        data.insert("direction".into(), Value::String(direction.into()));
        data.insert("target".into(), Value::String(target.to_string()));
        Some(data)
    }
}

/// `Killing` notes caused by a failing liveness probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct LivenessProbeClassifier;

const LIVENESS_SUFFIX: &str = "failed liveness probe, will be restarted";

impl NoteClassifier for LivenessProbeClassifier {
    fn reason(&self) -> &'static str {
        "Killing"
    }

    fn classify(&self, note: &str) -> Option<Map<String, Value>> {
        if !note.ends_with(LIVENESS_SUFFIX) {
            return None;
        }
        // "Container <name> failed liveness probe, ..."
        let container = note.splitn(3, ' ').nth(1)?;
        let mut data = Map::new();
        data.insert("reason".into(), Value::String("liveness_probe_failed".into()));
        data.insert("container".into(), Value::String(container.to_string()));
        Some(data)
    }
}

pub fn default_classifiers() -> Result<Vec<Arc<dyn NoteClassifier>>, regex::Error> {
    Ok(vec![Arc::new(HpaRescaleClassifier::new()?), Arc::new(LivenessProbeClassifier)])
}

fn dropped(cause: &'static str) {
    counter!("events_dropped_total", 1u64, "cause" => cause);
}

/// Build a fact from a raw events.k8s.io/v1 object. `None` when the note does not
/// classify or the event carries no usable uid.
pub fn classify_event(cluster: &str, classifier: &dyn NoteClassifier, raw: &Value) -> Option<EventFact> {
    let note = raw.get("note").and_then(Value::as_str).unwrap_or_default();
    let Some(data) = classifier.classify(note).filter(|d| !d.is_empty()) else {
        debug!(cluster, reason = classifier.reason(), note, "unmatched event note");
        dropped("unmatched");
        return None;
    };
    let uid = match meta_str(raw, "uid").map(Uuid::parse_str) {
        Some(Ok(uid)) => uid,
        _ => {
            warn!(cluster, name = meta_str(raw, "name").unwrap_or_default(), "event without a valid uid");
            dropped("invalid_uid");
            return None;
        }
    };
    let regarding = |field: &str| {
        raw.get("regarding").and_then(|r| r.get(field)).and_then(Value::as_str).unwrap_or_default().to_string()
    };
    let triggered_at = meta_str(raw, "creationTimestamp")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    Some(EventFact {
        uid,
        environment_name: cluster.to_string(),
        involved_kind: regarding("kind"),
        involved_name: regarding("name"),
        involved_namespace: regarding("namespace"),
        reason: raw.get("reason").and_then(Value::as_str).unwrap_or_default().to_string(),
        data: Value::Object(data),
        triggered_at,
    })
}

/// Collects facts and writes them on a fixed ticker. Nothing is written for an
/// interval without facts.
pub fn spawn_batcher(
    store: Arc<dyn EventStore>,
    mut rx: mpsc::Receiver<EventFact>,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Vec<EventFact> = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(fact) = rx.recv() => pending.push(fact),
                _ = ticker.tick() => {
                    if pending.is_empty() {
                        continue;
                    }
                    let batch = std::mem::take(&mut pending);
                    match store.upsert_events(&batch).await {
                        Ok(out) => {
                            for (row, err) in &out.failed {
                                warn!(row, error = %err, "event upsert failed");
                            }
                            debug!(num_rows = out.upserted, num_errors = out.failed.len(), "events flushed");
                        }
                        Err(e) => warn!(num_rows = batch.len(), error = %e, "event batch upsert failed"),
                    }
                }
            }
        }
        debug!(pending = pending.len(), "event batcher stopped");
    })
}

/// Leader-gated ingestion of classified Kubernetes events from every cluster.
pub struct EventIngester {
    clusters: Vec<Arc<dyn ClusterBackend>>,
    classifiers: Vec<Arc<dyn NoteClassifier>>,
    leader: Arc<LeaderCoordinator>,
    store: Arc<dyn EventStore>,
    system_namespace: String,
    flush_interval: Duration,
    reconnect_delay: Duration,
}

impl EventIngester {
    pub fn new(
        clusters: Vec<Arc<dyn ClusterBackend>>,
        classifiers: Vec<Arc<dyn NoteClassifier>>,
        leader: Arc<LeaderCoordinator>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            clusters,
            classifiers,
            leader,
            store,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn system_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.system_namespace = namespace.into();
        self
    }

    pub fn flush_interval(mut self, every: Duration) -> Self {
        self.flush_interval = every;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn params(&self, classifier: &dyn NoteClassifier) -> WatchParams {
        WatchParams::default().fields(format!("reason={},metadata.namespace!={}", classifier.reason(), self.system_namespace))
    }

    /// Start the batcher and hook the watches to leadership. Watches run for the
    /// length of each term; the returned handle is the batcher.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let batcher = spawn_batcher(self.store.clone(), rx, self.flush_interval, cancel.clone());

        let weak: Weak<Self> = Arc::downgrade(&self);
        self.leader.on_started_leading(move |term| {
            let Some(this) = weak.upgrade() else { return };
            info!(clusters = this.clusters.len(), "leading, starting event watches");
            for backend in &this.clusters {
                for classifier in &this.classifiers {
                    let watch = this.clone().watch(backend.clone(), classifier.clone(), tx.clone(), term.clone(), cancel.clone());
                    tokio::spawn(watch);
                }
            }
        });
        self.leader.on_stopped_leading(|| info!("leadership lost, stopping event watches"));
        batcher
    }

    async fn watch(
        self: Arc<Self>,
        backend: Arc<dyn ClusterBackend>,
        classifier: Arc<dyn NoteClassifier>,
        tx: mpsc::Sender<EventFact>,
        term: CancellationToken,
        cancel: CancellationToken,
    ) {
        let cluster = backend.cluster().to_string();
        let reason = classifier.reason();
        let resource = ResourceSpec::of::<Event>();
        let params = self.params(classifier.as_ref());
        loop {
            info!(cluster = %cluster, reason, "watching events");
            let mut stream = backend.watch(&resource, &params);
            loop {
                let next = tokio::select! {
                    _ = term.cancelled() => return,
                    _ = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(WatchEvent::Applied(raw))) => self.handle(&cluster, classifier.as_ref(), &raw, &tx, &term).await,
                    Some(Ok(WatchEvent::Restarted(list))) => {
                        for raw in &list {
                            if term.is_cancelled() {
                                break;
                            }
                            self.handle(&cluster, classifier.as_ref(), raw, &tx, &term).await;
                        }
                    }
                    Some(Ok(WatchEvent::Deleted(_))) => {}
                    Some(Err(e)) => {
                        warn!(cluster = %cluster, reason, error = %e, "event watch failed");
                        break;
                    }
                    None => break,
                }
            }
            info!(cluster = %cluster, reason, "event watch ended, reconnecting");
            tokio::select! {
                _ = term.cancelled() => return,
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn handle(
        &self,
        cluster: &str,
        classifier: &dyn NoteClassifier,
        raw: &Value,
        tx: &mpsc::Sender<EventFact>,
        term: &CancellationToken,
    ) {
        if !self.leader.is_leader() {
            return;
        }
        let Some(fact) = classify_event(cluster, classifier, raw) else { return };
        tokio::select! {
            _ = term.cancelled() => debug!(cluster, "term ended with the batcher full; event not forwarded"),
            sent = tx.send(fact) => match sent {
                Ok(()) => {
                    counter!("events_ingested_total", 1u64, "cluster" => cluster.to_string(), "reason" => classifier.reason());
                }
                Err(_) => debug!(cluster, "event batcher is gone"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetplane_leader::{ElectionParams, MemoryLeaseStore};
    use fleetplane_persist::MemoryStore;
    use serde_json::json;

    fn event(uid: &str, reason: &str, note: &str) -> Value {
        json!({
            "apiVersion": "events.k8s.io/v1",
            "kind": "Event",
            "metadata": {"name": "payments.17c", "namespace": "payments", "uid": uid, "creationTimestamp": "2024-05-01T10:00:00Z"},
            "reason": reason,
            "note": note,
            "regarding": {"kind": "HorizontalPodAutoscaler", "name": "payments", "namespace": "payments"}
        })
    }

    #[test]
    fn hpa_notes_carry_size_and_direction() {
        let c = HpaRescaleClassifier::new().unwrap();
        let data = c.classify("New size: 5; reason: cpu resource utilization (percentage of request) below target").unwrap();
        assert_eq!(data["newSize"], "5");
        assert_eq!(data["direction"], "down");
        assert_eq!(data["target"], "below");
        let up = c.classify("New size: 12; reason: memory resource utilization above target").unwrap();
        assert_eq!(up["direction"], "up");
        assert!(c.classify("New size: 3; reason: All metrics below target").is_some());
        assert!(c.classify("Scaled up replica set payments-7d9 to 3").is_none());
    }

    #[test]
    fn liveness_notes_name_the_container() {
        let c = LivenessProbeClassifier;
        let data = c.classify("Container payments-api failed liveness probe, will be restarted").unwrap();
        assert_eq!(Value::Object(data), json!({"reason": "liveness_probe_failed", "container": "payments-api"}));
        assert!(c.classify("Stopping container payments-api").is_none());
    }

    #[test]
    fn facts_take_identity_from_the_event() {
        let uid = "5f0c7a42-4c1e-4d7e-9a52-3d1fbb1e2a10";
        let raw = event(uid, "SuccessfulRescale", "New size: 5; reason: cpu below target");
        let fact = classify_event("dev", &HpaRescaleClassifier::new().unwrap(), &raw).unwrap();
        assert_eq!(fact.uid.to_string(), uid);
        assert_eq!(fact.environment_name, "dev");
        assert_eq!(fact.involved_kind, "HorizontalPodAutoscaler");
        assert_eq!(fact.involved_namespace, "payments");
        assert_eq!(fact.reason, "SuccessfulRescale");
        assert_eq!(fact.triggered_at.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn bad_uids_and_unmatched_notes_are_dropped() {
        let c = LivenessProbeClassifier;
        let bad_uid = event("not-a-uuid", "Killing", "Container x failed liveness probe, will be restarted");
        assert!(classify_event("dev", &c, &bad_uid).is_none());
        let unmatched = event("5f0c7a42-4c1e-4d7e-9a52-3d1fbb1e2a10", "Killing", "Stopping container x");
        assert!(classify_event("dev", &c, &unmatched).is_none());
    }

    fn fact(i: u128) -> EventFact {
        EventFact {
            uid: Uuid::from_u128(i + 1),
            environment_name: "dev".into(),
            involved_kind: "Pod".into(),
            involved_name: format!("pod-{i}"),
            involved_namespace: "team".into(),
            reason: "Killing".into(),
            data: json!({"reason": "liveness_probe_failed"}),
            triggered_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ended_term_does_not_wait_on_a_full_batcher() {
        let params = ElectionParams {
            lease_duration: Duration::from_millis(400),
            renew_deadline: Duration::from_millis(200),
            retry_period: Duration::from_millis(50),
        };
        let leader = LeaderCoordinator::new("a", Arc::new(MemoryLeaseStore::new()), params);
        let cancel = CancellationToken::new();
        leader.start(cancel.clone());
        for _ in 0..100 {
            if leader.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(leader.is_leader());

        let ingester = EventIngester::new(Vec::new(), default_classifiers().unwrap(), leader, Arc::new(MemoryStore::new()));
        let (tx, _rx) = mpsc::channel(1);
        tx.send(fact(0)).await.unwrap();
        let term = CancellationToken::new();
        {
            let term = term.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                term.cancel();
            });
        }
        let raw = event("5f0c7a42-4c1e-4d7e-9a52-3d1fbb1e2a11", "Killing", "Container x failed liveness probe, will be restarted");
        let handled = ingester.handle("dev", &LivenessProbeClassifier, &raw, &tx, &term);
        assert!(tokio::time::timeout(Duration::from_secs(2), handled).await.is_ok());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn batcher_is_silent_without_events_and_bounded_with_them() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let handle = spawn_batcher(Arc::new(store.clone()), rx, DEFAULT_FLUSH_INTERVAL, cancel.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.upsert_calls(), 0);

        for i in 0..30 {
            tx.send(fact(i)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let elapsed = started.elapsed().as_secs_f64();
        assert_eq!(store.events().len(), 30);
        assert!(store.upsert_calls() >= 2);
        assert!(store.upsert_calls() as f64 <= (elapsed / 2.0).ceil());
        cancel.cancel();
        handle.await.unwrap();
    }
}
