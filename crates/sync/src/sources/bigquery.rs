use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use fleetplane_core::CostRow;

use crate::cost::CostWarehouse;

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const TOKEN_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const LOCATION: &str = "EU";
const PAGE_SIZE: u32 = 10_000;
const POLL_TIMEOUT_MS: u64 = 10_000;

pub fn cost_query(table: &str, days: u32) -> String {
    format!(
        "SELECT * FROM `{table}` WHERE `team` IN UNNEST (@team_slugs) AND `date` >= TIMESTAMP_SUB(CURRENT_DATE(), INTERVAL {days} DAY)"
    )
}

/// Cost rows from the tenant's BigQuery cost table, read with the REST API and the
/// workload's metadata-server token.
pub struct BigQueryWarehouse {
    http: reqwest::Client,
    project: String,
    table: String,
}

impl BigQueryWarehouse {
    pub fn new(project: impl Into<String>, tenant: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("building bigquery http client")?;
        Ok(Self { http, project: project.into(), table: format!("nais-io.console.cost_{tenant}") })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct Token {
            access_token: String,
        }
        let token: Token = self
            .http
            .get(TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("requesting metadata token")?
            .error_for_status()?
            .json()
            .await
            .context("decoding metadata token")?;
        Ok(token.access_token)
    }

    async fn start_query(&self, token: &str, teams: &[String], days: u32) -> anyhow::Result<QueryPage> {
        let sql = cost_query(&self.table, days);
        info!(query = %sql, "querying bigquery");
        let values: Vec<Value> = teams.iter().map(|t| json!({ "value": t })).collect();
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "location": LOCATION,
            "parameterMode": "NAMED",
            "maxResults": PAGE_SIZE,
            "timeoutMs": POLL_TIMEOUT_MS,
            "queryParameters": [{
                "name": "team_slugs",
                "parameterType": {"type": "ARRAY", "arrayType": {"type": "STRING"}},
                "parameterValue": {"arrayValues": values}
            }]
        });
        let url = format!("{API_BASE}/projects/{}/queries", self.project);
        let page = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("starting bigquery job")?
            .error_for_status()?
            .json()
            .await
            .context("decoding bigquery response")?;
        Ok(page)
    }

    async fn next_page(&self, token: &str, job: &JobReference, page_token: Option<&str>) -> anyhow::Result<QueryPage> {
        let url = format!("{API_BASE}/projects/{}/queries/{}", self.project, job.job_id);
        let mut query = vec![
            ("location", job.location.clone().unwrap_or_else(|| LOCATION.to_string())),
            ("maxResults", PAGE_SIZE.to_string()),
            ("timeoutMs", POLL_TIMEOUT_MS.to_string()),
        ];
        if let Some(t) = page_token {
            query.push(("pageToken", t.to_string()));
        }
        let page = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .context("reading bigquery results")?
            .error_for_status()?
            .json()
            .await
            .context("decoding bigquery results")?;
        Ok(page)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<Schema>,
    #[serde(default)]
    rows: Vec<Row>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Schema {
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize)]
struct Field {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Row {
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    v: Value,
}

/// Column positions by name, from the result schema.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn new(schema: &Schema) -> Self {
        Self(schema.fields.iter().enumerate().map(|(i, f)| (f.name.clone(), i)).collect())
    }

    fn get<'a>(&self, row: &'a Row, name: &str) -> Option<&'a Value> {
        row.f.get(*self.0.get(name)?).map(|c| &c.v)
    }

    fn string(&self, row: &Row, name: &str) -> Option<String> {
        self.get(row, name)?.as_str().map(str::to_string)
    }
}

fn decode_row(cols: &Columns, row: &Row) -> Option<CostRow> {
    Some(CostRow {
        environment: cols.string(row, "env"),
        team_slug: cols.string(row, "team").unwrap_or_default(),
        app: cols.string(row, "app").unwrap_or_default(),
        cost_type: cols.string(row, "cost_type")?,
        date: NaiveDate::parse_from_str(&cols.string(row, "date")?, "%Y-%m-%d").ok()?,
        daily_cost: cols.string(row, "cost")?.parse().ok()?,
    })
}

#[async_trait]
impl CostWarehouse for BigQueryWarehouse {
    async fn stream_costs(&self, teams: &[String], days: u32, tx: mpsc::Sender<CostRow>) -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        let token = self.access_token().await?;
        let mut page = self.start_query(&token, teams, days).await?;
        let job = page.job_reference.take().ok_or_else(|| anyhow!("bigquery response without a job reference"))?;
        while !page.job_complete {
            page = self.next_page(&token, &job, None).await?;
        }
        let schema = page.schema.take().ok_or_else(|| anyhow!("bigquery result without a schema"))?;
        let cols = Columns::new(&schema);

        let (mut num_rows, mut skipped) = (0usize, 0usize);
        loop {
            for row in &page.rows {
                match decode_row(&cols, row) {
                    Some(cost) => {
                        tx.send(cost).await.context("cost consumer stopped")?;
                        num_rows += 1;
                    }
                    None => skipped += 1,
                }
            }
            let Some(next) = page.page_token.take() else { break };
            page = self.next_page(&token, &job, Some(&next)).await?;
        }
        if skipped > 0 {
            warn!(skipped, "skipped undecodable cost rows");
        }
        info!(duration_ms = started.elapsed().as_millis() as u64, num_rows, "done fetching data from bigquery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_targets_the_tenant_table() {
        let wh = BigQueryWarehouse::new("nais-io", "acme").unwrap();
        assert_eq!(wh.table(), "nais-io.console.cost_acme");
        assert_eq!(
            cost_query(wh.table(), 5),
            "SELECT * FROM `nais-io.console.cost_acme` WHERE `team` IN UNNEST (@team_slugs) AND `date` >= TIMESTAMP_SUB(CURRENT_DATE(), INTERVAL 5 DAY)"
        );
    }

    #[test]
    fn rows_decode_by_column_name() {
        let page: QueryPage = serde_json::from_value(json!({
            "jobComplete": true,
            "jobReference": {"jobId": "job_1", "location": "EU"},
            "schema": {"fields": [{"name": "env"}, {"name": "team"}, {"name": "app"}, {"name": "cost_type"}, {"name": "date"}, {"name": "cost"}]},
            "rows": [
                {"f": [{"v": null}, {"v": "payments"}, {"v": "api"}, {"v": "Cloud SQL"}, {"v": "2024-05-01"}, {"v": "12.5"}]},
                {"f": [{"v": "prod"}, {"v": "payments"}, {"v": "api"}, {"v": "Cloud SQL"}, {"v": "not a date"}, {"v": "1"}]}
            ]
        }))
        .unwrap();
        let cols = Columns::new(page.schema.as_ref().unwrap());
        let first = decode_row(&cols, &page.rows[0]).unwrap();
        assert_eq!(first.environment, None);
        assert_eq!(first.team_slug, "payments");
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(first.daily_cost, 12.5);
        assert!(decode_row(&cols, &page.rows[1]).is_none());
    }
}
