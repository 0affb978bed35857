//! fleetplane persistence: idempotent upserts of synchronized facts into Postgres.
//! Store traits for event, cost and usage rows, with Postgres and in-memory backends.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use fleetplane_core::{CostRow, EventFact, UsageRow};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgSettings, PgStore};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a batch upsert. Rows fail individually; the batch carries on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub upserted: usize,
    /// Index into the batch and the error for every rejected row.
    pub failed: Vec<(usize, String)>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        let offset = self.upserted + self.failed.len();
        self.upserted += other.upserted;
        self.failed.extend(other.failed.into_iter().map(|(i, e)| (i + offset, e)));
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert-or-update keyed by event uid.
    async fn upsert_events(&self, events: &[EventFact]) -> Result<BatchOutcome, PersistError>;
}

#[async_trait]
pub trait CostStore: Send + Sync {
    async fn last_cost_date(&self) -> Result<Option<NaiveDate>, PersistError>;
    async fn team_slugs(&self) -> Result<Vec<String>, PersistError>;
    async fn upsert_costs(&self, rows: &[CostRow]) -> Result<BatchOutcome, PersistError>;
    /// Refresh `cost_monthly_team`.
    async fn refresh_cost_views(&self) -> Result<(), PersistError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn max_usage_timestamp(&self) -> Result<Option<DateTime<Utc>>, PersistError>;
    async fn upsert_usage(&self, rows: &[UsageRow]) -> Result<BatchOutcome, PersistError>;
    /// Refresh `resource_team_range`.
    async fn refresh_usage_views(&self) -> Result<(), PersistError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_offsets_failed_rows() {
        let mut a = BatchOutcome { upserted: 2, failed: vec![(1, "x".into())] };
        a.merge(BatchOutcome { upserted: 1, failed: vec![(0, "y".into())] });
        assert_eq!(a.upserted, 3);
        assert_eq!(a.failed, vec![(1, "x".to_string()), (3, "y".to_string())]);
    }
}
