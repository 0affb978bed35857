use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::usage::{MetricsBackend, Series};

/// Range queries against one Prometheus per cluster.
pub struct PrometheusBackend {
    http: reqwest::Client,
    url_template: String,
    tenant: String,
}

impl PrometheusBackend {
    /// `url_template` may contain `{cluster}` and `{tenant}`.
    pub fn new(url_template: impl Into<String>, tenant: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building prometheus http client")?;
        Ok(Self { http, url_template: url_template.into(), tenant: tenant.into() })
    }

    pub fn base_url(&self, cluster: &str) -> String {
        self.url_template.replace("{cluster}", cluster).replace("{tenant}", &self.tenant)
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    status: String,
    data: Option<Data>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Data {
    result_type: String,
    result: Vec<MatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn timestamp(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
}

/// Decode a `query_range` body. Non-finite and unparseable samples are skipped.
fn parse_matrix(body: &[u8]) -> anyhow::Result<Vec<Series>> {
    let resp: Response = serde_json::from_slice(body).context("decoding prometheus response")?;
    if resp.status != "success" {
        bail!("prometheus query failed: {}", resp.error.unwrap_or(resp.status));
    }
    let data = resp.data.ok_or_else(|| anyhow!("prometheus response without data"))?;
    if data.result_type != "matrix" {
        bail!("expected a matrix result, got {}", data.result_type);
    }
    Ok(data
        .result
        .into_iter()
        .map(|s| Series {
            labels: s.metric,
            samples: s
                .values
                .iter()
                .filter_map(|(ts, v)| Some((timestamp(*ts)?, v.parse::<f64>().ok().filter(|v| v.is_finite())?)))
                .collect(),
        })
        .collect())
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn query_range(
        &self,
        cluster: &str,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> anyhow::Result<Vec<Series>> {
        let url = format!("{}/api/v1/query_range", self.base_url(cluster));
        debug!(cluster, %url, "prometheus range query");
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", format!("{}s", step.as_secs())),
            ])
            .send()
            .await
            .with_context(|| format!("querying {url}"))?;
        let body = resp.bytes().await.with_context(|| format!("reading {url}"))?;
        parse_matrix(&body)
    }
}
