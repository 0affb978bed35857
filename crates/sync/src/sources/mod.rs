//! HTTP clients for the external sources the importers read from.

mod bigquery;
mod prometheus;

pub use bigquery::{cost_query, BigQueryWarehouse};
pub use prometheus::PrometheusBackend;

pub const DEFAULT_PROMETHEUS_URL_TEMPLATE: &str = "https://prometheus.{cluster}.{tenant}.cloud.nais.io";
