//! Hourly resource usage and request import from each cluster's metrics backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fleetplane_core::{ResourceType, UsageRow};
use fleetplane_persist::{BatchOutcome, UsageStore};

use crate::{Clock, Importer};

pub const USAGE_BATCH_SIZE: usize = 100_000;
pub const MAX_DAYS_BACK: i64 = 30;
const STEP: Duration = Duration::from_secs(3600);

const IGNORED_NAMESPACES: &[&str] = &[
    "kube-system",
    "nais-system",
    "cnrm-system",
    "configconnector-operator-system",
    "linkerd",
    "gke-mcs",
    "gke-managed-system",
    "kyverno",
    "default",
    "kube-node-lease",
    "kube-public",
];

const IGNORED_CONTAINERS: &[&str] = &[
    "elector",
    "linkerd-proxy",
    "cloudsql-proxy",
    "secure-logs-fluentd",
    "secure-logs-configmap-reload",
    "secure-logs-fluentbit",
    "wonderwall",
    "vks-sidecar",
];

/// One labelled time series from a range query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<(DateTime<Utc>, f64)>,
}

#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query_range(
        &self,
        cluster: &str,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> anyhow::Result<Vec<Series>>;
}

fn selector() -> String {
    // the trailing empty alternative also drops series without a container
    format!(r#"namespace!~"{}", container!~"{}||""#, IGNORED_NAMESPACES.join("|"), IGNORED_CONTAINERS.join("|"))
}

pub fn usage_query(resource: ResourceType) -> String {
    match resource {
        ResourceType::Cpu => format!(
            "sum by (namespace, container) (rate(container_cpu_usage_seconds_total{{{}}}[5m]))",
            selector()
        ),
        ResourceType::Memory => {
            format!("sum by (namespace, container) (container_memory_working_set_bytes{{{}}})", selector())
        }
    }
}

pub fn request_query(resource: ResourceType) -> String {
    let (name, unit) = match resource {
        ResourceType::Cpu => ("cpu", "core"),
        ResourceType::Memory => ("memory", "byte"),
    };
    format!(
        r#"sum by (namespace, container) (kube_pod_container_resource_requests{{{}, resource="{name}",unit="{unit}"}})"#,
        selector()
    )
}

type JoinKey = (DateTime<Utc>, String, String);

fn series_key(s: &Series) -> Option<(&str, &str)> {
    Some((s.labels.get("namespace")?.as_str(), s.labels.get("container")?.as_str()))
}

/// Pair usage samples with request samples on `(timestamp, team, app)`. A usage
/// sample without a matching request gets a request of zero.
pub fn join_samples(
    environment: &str,
    resource: ResourceType,
    usage: &[Series],
    requests: &[Series],
) -> Vec<UsageRow> {
    let mut req: HashMap<JoinKey, f64> = HashMap::new();
    for s in requests {
        let Some((team, app)) = series_key(s) else { continue };
        for (ts, v) in &s.samples {
            req.insert((*ts, team.to_string(), app.to_string()), *v);
        }
    }
    let mut rows = Vec::new();
    for s in usage {
        let Some((team, app)) = series_key(s) else { continue };
        for (ts, v) in &s.samples {
            let key = (*ts, team.to_string(), app.to_string());
            rows.push(UsageRow {
                timestamp: *ts,
                environment: environment.to_string(),
                team_slug: team.to_string(),
                app: app.to_string(),
                resource_type: resource,
                usage: *v,
                request: req.get(&key).copied().unwrap_or(0.0),
            });
        }
    }
    rows
}

pub struct UsageImporter {
    store: Arc<dyn UsageStore>,
    metrics: Arc<dyn MetricsBackend>,
    clusters: Vec<String>,
    clock: Clock,
    batch_size: usize,
}

impl UsageImporter {
    pub fn new(store: Arc<dyn UsageStore>, metrics: Arc<dyn MetricsBackend>, clusters: Vec<String>, clock: Clock) -> Self {
        Self { store, metrics, clusters, clock, batch_size: USAGE_BATCH_SIZE }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    async fn window(&self, cluster: &str, resource: ResourceType, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Vec<UsageRow>> {
        let usage = self.metrics.query_range(cluster, &usage_query(resource), start, end, STEP).await?;
        let requests = self.metrics.query_range(cluster, &request_query(resource), start, end, STEP).await?;
        Ok(join_samples(cluster, resource, &usage, &requests))
    }
}

#[async_trait]
impl Importer for UsageImporter {
    type Row = UsageRow;

    fn name(&self) -> &'static str {
        "resource_usage"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn should_run(&self) -> anyhow::Result<bool> {
        let Some(newest) = self.store.max_usage_timestamp().await.context("reading newest usage sample")? else {
            return Ok(true);
        };
        let since = (self.clock)() - newest;
        if since < chrono::Duration::hours(1) {
            info!(newest = %newest, "resource usage is current");
            return Ok(false);
        }
        Ok(true)
    }

    async fn produce(&self, tx: mpsc::Sender<UsageRow>) -> anyhow::Result<()> {
        let now = (self.clock)();
        let end = now.duration_trunc(chrono::Duration::hours(1)).unwrap_or(now);
        let earliest = end - chrono::Duration::days(MAX_DAYS_BACK);
        let start = match self.store.max_usage_timestamp().await? {
            Some(newest) => (newest + chrono::Duration::hours(1)).max(earliest),
            None => earliest,
        };
        info!(start = %start, end = %end, clusters = self.clusters.len(), "fetching resource usage");

        let mut day = start;
        while day <= end {
            let day_end = (day + chrono::Duration::hours(23)).min(end);
            for cluster in &self.clusters {
                for resource in ResourceType::ALL {
                    let rows = match self.window(cluster, resource, day, day_end).await {
                        Ok(rows) => rows,
                        Err(e) => {
                            warn!(cluster = %cluster, resource = %resource, start = %day, error = %e, "usage query failed");
                            continue;
                        }
                    };
                    debug!(cluster = %cluster, resource = %resource, start = %day, num_rows = rows.len(), "usage window fetched");
                    for row in rows {
                        tx.send(row).await.context("usage consumer stopped")?;
                    }
                }
            }
            day += chrono::Duration::days(1);
        }
        Ok(())
    }

    async fn upsert(&self, batch: &[UsageRow]) -> anyhow::Result<BatchOutcome> {
        Ok(self.store.upsert_usage(batch).await?)
    }

    async fn post_process(&self) -> anyhow::Result<()> {
        self.store.refresh_usage_views().await.context("refreshing resource_team_range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScheduledSynchronizer, TickOutcome};
    use chrono::TimeZone;
    use fleetplane_persist::MemoryStore;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    fn series(team: &str, app: &str, samples: &[(DateTime<Utc>, f64)]) -> Series {
        let labels = [("namespace", team), ("container", app)].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Series { labels, samples: samples.to_vec() }
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, 0, 0).unwrap()
    }

    #[test]
    fn queries_filter_platform_namespaces_and_sidecars() {
        let q = usage_query(ResourceType::Cpu);
        assert!(q.starts_with("sum by (namespace, container) (rate(container_cpu_usage_seconds_total{namespace!~\"kube-system|"));
        assert!(q.contains("vks-sidecar||\"}[5m]))"));
        let r = request_query(ResourceType::Memory);
        assert!(r.contains("kube_pod_container_resource_requests{"));
        assert!(r.ends_with(", resource=\"memory\",unit=\"byte\"})"));
    }

    #[test]
    fn usage_joins_requests_on_time_team_and_app() {
        let usage = vec![series("a", "api", &[(hour(1), 0.5), (hour(2), 0.7)]), series("b", "web", &[(hour(1), 0.1)])];
        let requests = vec![series("a", "api", &[(hour(1), 1.0), (hour(2), 2.0)]), series("a", "worker", &[(hour(1), 9.0)])];
        let rows = join_samples("prod", ResourceType::Cpu, &usage, &requests);
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].usage, rows[0].request), (0.5, 1.0));
        assert_eq!((rows[1].usage, rows[1].request), (0.7, 2.0));
        assert_eq!((rows[2].team_slug.as_str(), rows[2].request), ("b", 0.0));
        assert!(rows.iter().all(|r| r.environment == "prod"));
    }

    struct Fake {
        calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl MetricsBackend for Fake {
        async fn query_range(
            &self,
            cluster: &str,
            query: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            _step: Duration,
        ) -> anyhow::Result<Vec<Series>> {
            self.calls.lock().unwrap().push((cluster.to_string(), start, end));
            let v = if query.contains("requests") { 2.0 } else { 1.0 };
            Ok(vec![series("team", "app", &[(start, v)])])
        }
    }

    #[tokio::test]
    async fn pages_by_day_from_the_newest_sample() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 12, 30, 0).unwrap();
        let seed = UsageRow {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 5, 6, 0, 0).unwrap(),
            environment: "dev".into(),
            team_slug: "team".into(),
            app: "app".into(),
            resource_type: ResourceType::Cpu,
            usage: 1.0,
            request: 1.0,
        };
        store.upsert_usage(&[seed]).await.unwrap();
        let fake = Arc::new(Fake { calls: Mutex::new(Vec::new()) });
        let imp = UsageImporter::new(Arc::new(store.clone()), fake.clone(), vec!["dev".into()], Arc::new(move || now));
        assert!(imp.should_run().await.unwrap());
        let sync = ScheduledSynchronizer::new(imp, Arc::new(AtomicBool::new(true)), Duration::from_secs(3600));

        let TickOutcome::Ran(report) = sync.tick().await else { panic!("expected a run") };
        assert!(report.success());
        let calls = fake.calls.lock().unwrap().clone();
        // two days, two resource types, usage and request each
        assert_eq!(calls.len(), 8);
        assert_eq!(calls[0].1, Utc.with_ymd_and_hms(2024, 5, 5, 7, 0, 0).unwrap());
        assert_eq!(calls[0].2, Utc.with_ymd_and_hms(2024, 5, 6, 6, 0, 0).unwrap());
        assert_eq!(calls[7].2, Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap());
        assert_eq!(store.view_refreshes(), 1);
        let row = store.usage().into_iter().find(|r| r.timestamp == calls[0].1).unwrap();
        assert_eq!((row.usage, row.request), (1.0, 2.0));
    }

    #[tokio::test]
    async fn guard_waits_a_full_hour() {
        let store = MemoryStore::new();
        let newest = hour(10);
        let row = UsageRow {
            timestamp: newest,
            environment: "dev".into(),
            team_slug: "t".into(),
            app: "a".into(),
            resource_type: ResourceType::Memory,
            usage: 1.0,
            request: 1.0,
        };
        store.upsert_usage(&[row]).await.unwrap();
        let fake = Arc::new(Fake { calls: Mutex::new(Vec::new()) });
        let soon = UsageImporter::new(Arc::new(store.clone()), fake.clone(), vec![], Arc::new(move || newest + chrono::Duration::minutes(59)));
        assert!(!soon.should_run().await.unwrap());
        let later = UsageImporter::new(Arc::new(store.clone()), fake, vec![], Arc::new(move || newest + chrono::Duration::hours(1)));
        assert!(later.should_run().await.unwrap());
    }
}
