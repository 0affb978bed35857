use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, histogram};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info, warn};

use fleetplane_core::{CostRow, EventFact, UsageRow};

use crate::{BatchOutcome, CostStore, EventStore, PersistError, UsageStore};

#[derive(Debug, Clone)]
pub struct PgSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), max_connections: 10, acquire_timeout: Duration::from_secs(10) }
    }
}

/// Postgres-backed store. Each batch is written as one `UNNEST` statement.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(settings: &PgSettings) -> Result<Self, PersistError> {
        let started = Instant::now();
        let opts = PgConnectOptions::from_str(&settings.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(opts)
            .await?;
        histogram!("persist_connect_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), PersistError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn record(table: &'static str, started: Instant, out: &BatchOutcome) {
    histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0, "table" => table);
    counter!("persist_upsert_rows_total", out.upserted as u64, "table" => table);
    if !out.failed.is_empty() {
        counter!("persist_upsert_errors_total", out.failed.len() as u64, "table" => table);
    }
    debug!(table, num_rows = out.upserted, num_errors = out.failed.len(), "batch upserted");
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

macro_rules! upsert_event {
    ($source:literal) => {
        concat!(
            "INSERT INTO events (uid, environment_name, involved_kind, involved_name, involved_namespace, reason, data, triggered_at) ",
            $source,
            " ON CONFLICT (uid) DO UPDATE SET
                environment_name = EXCLUDED.environment_name,
                involved_kind = EXCLUDED.involved_kind,
                involved_name = EXCLUDED.involved_name,
                involved_namespace = EXCLUDED.involved_namespace,
                reason = EXCLUDED.reason,
                data = EXCLUDED.data,
                triggered_at = EXCLUDED.triggered_at"
        )
    };
}

macro_rules! upsert_cost {
    ($source:literal) => {
        concat!(
            "INSERT INTO cost (environment, team_slug, app, cost_type, date, daily_cost) ",
            $source,
            " ON CONFLICT (COALESCE(environment, ''), team_slug, app, cost_type, date) DO UPDATE SET
                daily_cost = EXCLUDED.daily_cost"
        )
    };
}

macro_rules! upsert_usage {
    ($source:literal) => {
        concat!(
            "INSERT INTO resource_utilization_metrics (timestamp, environment, team_slug, app, resource_type, usage, request) ",
            $source,
            " ON CONFLICT (timestamp, environment, team_slug, app, resource_type) DO UPDATE SET
                usage = EXCLUDED.usage,
                request = EXCLUDED.request"
        )
    };
}

const UPSERT_EVENT_ROW: &str = upsert_event!("VALUES ($1, $2, $3, $4, $5, $6, $7, $8)");
const UPSERT_EVENT_BATCH: &str = upsert_event!(
    "SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], $7::jsonb[], $8::timestamptz[])"
);
const UPSERT_COST_ROW: &str = upsert_cost!("VALUES ($1, $2, $3, $4, $5, $6)");
const UPSERT_COST_BATCH: &str =
    upsert_cost!("SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::date[], $6::real[])");
const UPSERT_USAGE_ROW: &str = upsert_usage!("VALUES ($1, $2, $3, $4, $5, $6, $7)");
const UPSERT_USAGE_BATCH: &str = upsert_usage!(
    "SELECT * FROM UNNEST($1::timestamptz[], $2::text[], $3::text[], $4::text[], $5::text[], $6::float8[], $7::float8[])"
);

fn column<R, T>(rows: &[R], f: impl Fn(&R) -> T) -> Vec<T> {
    rows.iter().map(f).collect()
}

impl PgStore {
    /// One multi-row statement in a transaction. If it is rejected the batch is
    /// replayed row by row, each behind a savepoint, so only the offending rows fail.
    async fn write_batch<'r, R: Sync>(
        &self,
        table: &'static str,
        rows: &'r [R],
        bulk: PgQuery<'r>,
        single: impl Fn(&'r R) -> PgQuery<'r> + Send + Sync,
    ) -> Result<BatchOutcome, PersistError> {
        let started = Instant::now();
        if rows.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut tx = self.pool.begin().await?;
        let out = match bulk.execute(&mut *tx).await {
            Ok(_) => {
                tx.commit().await?;
                BatchOutcome { upserted: rows.len(), failed: Vec::new() }
            }
            Err(e) => {
                warn!(table, num_rows = rows.len(), error = %e, "bulk upsert rejected, retrying row by row");
                tx.rollback().await?;
                let mut tx = self.pool.begin().await?;
                let mut out = BatchOutcome::default();
                for (i, row) in rows.iter().enumerate() {
                    sqlx::query("SAVEPOINT upsert_row").execute(&mut *tx).await?;
                    match single(row).execute(&mut *tx).await {
                        Ok(_) => {
                            sqlx::query("RELEASE SAVEPOINT upsert_row").execute(&mut *tx).await?;
                            out.upserted += 1;
                        }
                        Err(e) => {
                            sqlx::query("ROLLBACK TO SAVEPOINT upsert_row").execute(&mut *tx).await?;
                            out.failed.push((i, e.to_string()));
                        }
                    }
                }
                tx.commit().await?;
                out
            }
        };
        record(table, started, &out);
        Ok(out)
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_events(&self, events: &[EventFact]) -> Result<BatchOutcome, PersistError> {
        let bulk = sqlx::query(UPSERT_EVENT_BATCH)
            .bind(column(events, |e| e.uid))
            .bind(column(events, |e| e.environment_name.clone()))
            .bind(column(events, |e| e.involved_kind.clone()))
            .bind(column(events, |e| e.involved_name.clone()))
            .bind(column(events, |e| e.involved_namespace.clone()))
            .bind(column(events, |e| e.reason.clone()))
            .bind(column(events, |e| e.data.clone()))
            .bind(column(events, |e| e.triggered_at));
        self.write_batch("events", events, bulk, |e| {
            sqlx::query(UPSERT_EVENT_ROW)
                .bind(e.uid)
                .bind(&e.environment_name)
                .bind(&e.involved_kind)
                .bind(&e.involved_name)
                .bind(&e.involved_namespace)
                .bind(&e.reason)
                .bind(&e.data)
                .bind(e.triggered_at)
        })
        .await
    }
}

#[async_trait]
impl CostStore for PgStore {
    async fn last_cost_date(&self) -> Result<Option<NaiveDate>, PersistError> {
        Ok(sqlx::query_scalar::<_, Option<NaiveDate>>("SELECT MAX(date) FROM cost").fetch_one(&self.pool).await?)
    }

    async fn team_slugs(&self) -> Result<Vec<String>, PersistError> {
        Ok(sqlx::query_scalar::<_, String>("SELECT slug FROM teams ORDER BY slug").fetch_all(&self.pool).await?)
    }

    async fn upsert_costs(&self, rows: &[CostRow]) -> Result<BatchOutcome, PersistError> {
        let bulk = sqlx::query(UPSERT_COST_BATCH)
            .bind(column(rows, |r| r.environment.clone()))
            .bind(column(rows, |r| r.team_slug.clone()))
            .bind(column(rows, |r| r.app.clone()))
            .bind(column(rows, |r| r.cost_type.clone()))
            .bind(column(rows, |r| r.date))
            .bind(column(rows, |r| r.daily_cost));
        self.write_batch("cost", rows, bulk, |r| {
            sqlx::query(UPSERT_COST_ROW)
                .bind(&r.environment)
                .bind(&r.team_slug)
                .bind(&r.app)
                .bind(&r.cost_type)
                .bind(r.date)
                .bind(r.daily_cost)
        })
        .await
    }

    async fn refresh_cost_views(&self) -> Result<(), PersistError> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY cost_monthly_team").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn max_usage_timestamp(&self) -> Result<Option<DateTime<Utc>>, PersistError> {
        Ok(sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT MAX(timestamp) FROM resource_utilization_metrics")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn upsert_usage(&self, rows: &[UsageRow]) -> Result<BatchOutcome, PersistError> {
        let bulk = sqlx::query(UPSERT_USAGE_BATCH)
            .bind(column(rows, |r| r.timestamp))
            .bind(column(rows, |r| r.environment.clone()))
            .bind(column(rows, |r| r.team_slug.clone()))
            .bind(column(rows, |r| r.app.clone()))
            .bind(column(rows, |r| r.resource_type.as_str()))
            .bind(column(rows, |r| r.usage))
            .bind(column(rows, |r| r.request));
        self.write_batch("resource_utilization_metrics", rows, bulk, |r| {
            sqlx::query(UPSERT_USAGE_ROW)
                .bind(r.timestamp)
                .bind(&r.environment)
                .bind(&r.team_slug)
                .bind(&r.app)
                .bind(r.resource_type.as_str())
                .bind(r.usage)
                .bind(r.request)
        })
        .await
    }

    async fn refresh_usage_views(&self) -> Result<(), PersistError> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY resource_team_range").execute(&self.pool).await?;
        Ok(())
    }
}
