use std::net::SocketAddr;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let env = std::env::var("FLEETPLANE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_str(&env).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(%addr, "Prometheus metrics exporter listening"),
        Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
    }
}
