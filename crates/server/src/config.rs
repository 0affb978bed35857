use std::net::SocketAddr;

use clap::{ArgAction, Args, Parser, Subcommand};

use fleetplane_core::DEFAULT_SYSTEM_NAMESPACE;
use fleetplane_kubehub::{ClusterSource, StaticCluster};
use fleetplane_sync::sources::DEFAULT_PROMETHEUS_URL_TEMPLATE;

#[derive(Parser, Debug)]
#[command(name = "fleetplane", version, about = "Multi-cluster synchronization engine")]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run caches, leader election and importers until interrupted (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Kubeconfig contexts to watch, one per cluster
    #[arg(long = "kubernetes-clusters", env = "KUBERNETES_CLUSTERS", value_delimiter = ',')]
    pub clusters: Vec<String>,

    /// Clusters reached by endpoint and token, as `name|host|token`
    #[arg(long = "kubernetes-clusters-static", env = "KUBERNETES_CLUSTERS_STATIC", value_delimiter = ',')]
    pub static_clusters: Vec<StaticCluster>,

    #[arg(long, env = "LEASE_NAME", default_value = "fleetplane")]
    pub lease_name: String,

    #[arg(long, env = "LEASE_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub lease_namespace: String,

    /// Namespace whose objects and events are never mirrored
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    #[arg(long, env = "TENANT", default_value = "dev-nais")]
    pub tenant: String,

    #[arg(long = "cost-data-import-enabled", env = "COST_DATA_IMPORT_ENABLED", action = ArgAction::Set, default_value_t = false)]
    pub cost_import: bool,

    #[arg(long = "bigquery-projectid", env = "BIGQUERY_PROJECTID", default_value = "nais-io")]
    pub bigquery_project: String,

    #[arg(
        long = "resource-utilization-import-enabled",
        env = "RESOURCE_UTILIZATION_IMPORT_ENABLED",
        action = ArgAction::Set,
        default_value_t = false
    )]
    pub usage_import: bool,

    /// Prometheus base URL; `{cluster}` and `{tenant}` are substituted
    #[arg(long, env = "PROMETHEUS_URL_TEMPLATE", default_value = DEFAULT_PROMETHEUS_URL_TEMPLATE)]
    pub prometheus_url_template: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "FLEETPLANE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// In-memory lease and store, no clusters
    #[arg(long = "with-fake-clients", env = "WITH_FAKE_CLIENTS", action = ArgAction::Set, default_value_t = false)]
    pub fake_clients: bool,
}

impl Config {
    pub fn cluster_sources(&self) -> Vec<ClusterSource> {
        let contexts = self.clusters.iter().filter(|c| !c.trim().is_empty()).map(|c| ClusterSource::Context(c.trim().to_string()));
        contexts.chain(self.static_clusters.iter().cloned().map(ClusterSource::Static)).collect()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.cluster_sources().iter().map(|s| s.name().to_string()).collect()
    }
}
