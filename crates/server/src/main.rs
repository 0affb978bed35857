#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetplane_api::{ControlPlane, FleetApi};
use fleetplane_kubehub::{ClusterBackend, ClusterClientSet};
use fleetplane_leader::{default_identity, ElectionParams, KubeLeaseStore, LeaderCoordinator, LeaseStore, MemoryLeaseStore};
use fleetplane_persist::{CostStore, EventStore, MemoryStore, PgSettings, PgStore, UsageStore};
use fleetplane_sync::sources::{BigQueryWarehouse, PrometheusBackend};
use fleetplane_sync::{
    default_classifiers, system_clock, CostImporter, EventIngester, Leadership, ScheduledSynchronizer, UsageImporter,
};

mod config;
mod telemetry;

use config::{Cli, Command, Config};

const COST_SCHEDULE: Duration = Duration::from_secs(60 * 60);
const USAGE_SCHEDULE: Duration = Duration::from_secs(60 * 60);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Stores {
    events: Arc<dyn EventStore>,
    costs: Arc<dyn CostStore>,
    usage: Arc<dyn UsageStore>,
}

impl Stores {
    fn of<S: EventStore + CostStore + UsageStore + 'static>(s: S) -> Self {
        let s = Arc::new(s);
        Self { events: s.clone(), costs: s.clone(), usage: s }
    }
}

async fn connect_store(cfg: &Config) -> Result<Stores> {
    match (&cfg.database_url, cfg.fake_clients) {
        (Some(url), _) => {
            let store = PgStore::connect(&PgSettings::new(url)).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Stores::of(store))
        }
        (None, true) => {
            warn!("no DATABASE_URL, using the in-memory store");
            Ok(Stores::of(MemoryStore::new()))
        }
        (None, false) => bail!("DATABASE_URL is required unless running with fake clients"),
    }
}

async fn connect_clusters(cfg: &Config) -> Result<(Vec<Arc<dyn ClusterBackend>>, Arc<dyn LeaseStore>)> {
    if cfg.fake_clients {
        info!("running with fake clients: no clusters, in-memory lease");
        return Ok((Vec::new(), Arc::new(MemoryLeaseStore::new())));
    }
    let sources = cfg.cluster_sources();
    if sources.is_empty() {
        warn!("no clusters configured");
    }
    let clusters = ClusterClientSet::connect_all(&sources).await.context("configuring cluster clients")?;
    let backends = clusters.into_iter().map(|c| Arc::new(c) as Arc<dyn ClusterBackend>).collect();
    let local = kube::Client::try_default().await.context("building client for the lease")?;
    let lease = KubeLeaseStore::new(local, &cfg.lease_namespace, &cfg.lease_name);
    Ok((backends, Arc::new(lease)))
}

async fn migrate(cfg: &Config) -> Result<()> {
    let Some(url) = &cfg.database_url else { bail!("DATABASE_URL is required for migrate") };
    let store = PgStore::connect(&PgSettings::new(url)).await.context("connecting to postgres")?;
    store.migrate().await?;
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let stores = connect_store(&cfg).await?;
    let (backends, lease) = connect_clusters(&cfg).await?;

    let leader = LeaderCoordinator::new(default_identity(), lease, ElectionParams::default());
    info!(identity = %leader.identity(), clusters = backends.len(), "starting");
    let plane = ControlPlane::new(backends.clone(), leader.clone(), &cfg.system_namespace);

    let mut tasks: Vec<JoinHandle<()>> = plane.start(cancel.child_token());
    tasks.push(leader.start(cancel.clone()));

    let ingester = EventIngester::new(backends, default_classifiers()?, leader.clone(), stores.events)
        .system_namespace(cfg.system_namespace.clone());
    tasks.push(Arc::new(ingester).start(cancel.child_token()));

    let leadership: Arc<dyn Leadership> = leader.clone();
    if cfg.cost_import {
        let warehouse = BigQueryWarehouse::new(cfg.bigquery_project.clone(), &cfg.tenant)?;
        let importer = CostImporter::new(stores.costs, Arc::new(warehouse), system_clock());
        let sync = ScheduledSynchronizer::new(importer, leadership.clone(), COST_SCHEDULE);
        tasks.push(Arc::new(sync).spawn(cancel.child_token()));
    } else {
        warn!("cost data import is not enabled");
    }
    if cfg.usage_import {
        let prometheus = PrometheusBackend::new(cfg.prometheus_url_template.clone(), cfg.tenant.clone())?;
        let importer = UsageImporter::new(stores.usage, Arc::new(prometheus), cfg.cluster_names(), system_clock());
        let sync = ScheduledSynchronizer::new(importer, leadership, USAGE_SCHEDULE);
        tasks.push(Arc::new(sync).spawn(cancel.child_token()));
    } else {
        warn!("resource utilization import is not enabled");
    }

    match plane.wait_for_ready(READY_TIMEOUT).await {
        Ok(()) => info!("caches synced"),
        Err(e) => warn!(error = %e, "caches not synced yet, serving what is there"),
    }
    if let Ok(status) = plane.status().await {
        info!(status = %serde_json::to_string(&status).unwrap_or_default(), "control plane status");
    }

    shutdown_signal().await;
    info!("shutting down");
    cancel.cancel();
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("task did not stop within the grace period");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing();
    telemetry::init_metrics(cli.config.metrics_addr);

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => migrate(&cli.config).await,
        Command::Run => run(cli.config).await,
    }
}
