//! Daily cost import from the billing warehouse.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Timelike;
use tokio::sync::mpsc;
use tracing::info;

use fleetplane_core::CostRow;
use fleetplane_persist::{BatchOutcome, CostStore};

use crate::{Clock, Importer};

pub const COST_BATCH_SIZE: usize = 100_000;
pub const COST_DAYS_TO_FETCH: u32 = 5;
/// Warehouse rows for a day are complete by this UTC hour.
const EARLIEST_HOUR: u32 = 5;

/// Source of per-day cost rows.
#[async_trait]
pub trait CostWarehouse: Send + Sync {
    /// Stream every row for `teams` from the last `days` days into `tx`.
    async fn stream_costs(&self, teams: &[String], days: u32, tx: mpsc::Sender<CostRow>) -> anyhow::Result<()>;
}

pub struct CostImporter {
    store: Arc<dyn CostStore>,
    warehouse: Arc<dyn CostWarehouse>,
    clock: Clock,
    days_to_fetch: u32,
    batch_size: usize,
}

impl CostImporter {
    pub fn new(store: Arc<dyn CostStore>, warehouse: Arc<dyn CostWarehouse>, clock: Clock) -> Self {
        Self { store, warehouse, clock, days_to_fetch: COST_DAYS_TO_FETCH, batch_size: COST_BATCH_SIZE }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }
}

#[async_trait]
impl Importer for CostImporter {
    type Row = CostRow;

    fn name(&self) -> &'static str {
        "cost"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn should_run(&self) -> anyhow::Result<bool> {
        let now = (self.clock)();
        let last = self.store.last_cost_date().await.context("reading last cost date")?;
        if last == Some(now.date_naive()) {
            info!(last_date = %now.date_naive(), "cost data already imported today");
            return Ok(false);
        }
        if now.hour() < EARLIEST_HOUR {
            info!(hour = now.hour(), "too early for today's cost data");
            return Ok(false);
        }
        Ok(true)
    }

    async fn produce(&self, tx: mpsc::Sender<CostRow>) -> anyhow::Result<()> {
        let teams = self.store.team_slugs().await.context("listing team slugs")?;
        if teams.is_empty() {
            bail!("no team slugs found in the store");
        }
        info!(teams = teams.len(), days = self.days_to_fetch, "fetching cost data");
        self.warehouse.stream_costs(&teams, self.days_to_fetch, tx).await
    }

    async fn upsert(&self, batch: &[CostRow]) -> anyhow::Result<BatchOutcome> {
        Ok(self.store.upsert_costs(batch).await?)
    }

    async fn post_process(&self) -> anyhow::Result<()> {
        self.store.refresh_cost_views().await.context("refreshing cost_monthly_team")
    }
}
