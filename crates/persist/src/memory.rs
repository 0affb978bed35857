use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use fleetplane_core::{CostRow, EventFact, ResourceType, UsageRow};

use crate::{BatchOutcome, CostStore, EventStore, PersistError, UsageStore};

type CostKey = (Option<String>, String, String, String, NaiveDate);
type UsageKey = (DateTime<Utc>, String, String, String, ResourceType);

#[derive(Default)]
struct State {
    events: BTreeMap<Uuid, EventFact>,
    costs: BTreeMap<CostKey, CostRow>,
    usage: BTreeMap<UsageKey, UsageRow>,
    teams: Vec<String>,
    rejected_teams: Vec<String>,
    upsert_calls: usize,
    view_refreshes: usize,
}

/// In-process store with the same keys and conflict rules as the Postgres schema.
/// Used when running with fake clients and by tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_teams(self, teams: &[&str]) -> Self {
        self.lock().teams = teams.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Rows for this team fail individually, like a constraint violation would.
    pub fn reject_team(&self, team: &str) {
        self.lock().rejected_teams.push(team.to_string());
    }

    pub fn events(&self) -> Vec<EventFact> {
        self.lock().events.values().cloned().collect()
    }

    pub fn costs(&self) -> Vec<CostRow> {
        self.lock().costs.values().cloned().collect()
    }

    pub fn usage(&self) -> Vec<UsageRow> {
        self.lock().usage.values().cloned().collect()
    }

    /// Number of upsert calls across all tables, including empty ones.
    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }

    pub fn view_refreshes(&self) -> usize {
        self.lock().view_refreshes
    }

    fn upsert<R: Clone, K: Ord>(
        &self,
        rows: &[R],
        team: impl Fn(&R) -> &str,
        key: impl Fn(&R) -> K,
        table: impl Fn(&mut State) -> &mut BTreeMap<K, R>,
    ) -> BatchOutcome {
        let mut state = self.lock();
        state.upsert_calls += 1;
        let mut out = BatchOutcome::default();
        for (i, row) in rows.iter().enumerate() {
            if state.rejected_teams.iter().any(|t| t == team(row)) {
                out.failed.push((i, format!("team {} rejected", team(row))));
                continue;
            }
            table(&mut state).insert(key(row), row.clone());
            out.upserted += 1;
        }
        out
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_events(&self, events: &[EventFact]) -> Result<BatchOutcome, PersistError> {
        Ok(self.upsert(events, |e| &e.involved_namespace, |e| e.uid, |s| &mut s.events))
    }
}

#[async_trait]
impl CostStore for MemoryStore {
    async fn last_cost_date(&self) -> Result<Option<NaiveDate>, PersistError> {
        Ok(self.lock().costs.values().map(|r| r.date).max())
    }

    async fn team_slugs(&self) -> Result<Vec<String>, PersistError> {
        Ok(self.lock().teams.clone())
    }

    async fn upsert_costs(&self, rows: &[CostRow]) -> Result<BatchOutcome, PersistError> {
        Ok(self.upsert(
            rows,
            |r| &r.team_slug,
            |r| (r.environment.clone(), r.team_slug.clone(), r.app.clone(), r.cost_type.clone(), r.date),
            |s| &mut s.costs,
        ))
    }

    async fn refresh_cost_views(&self) -> Result<(), PersistError> {
        self.lock().view_refreshes += 1;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn max_usage_timestamp(&self) -> Result<Option<DateTime<Utc>>, PersistError> {
        Ok(self.lock().usage.values().map(|r| r.timestamp).max())
    }

    async fn upsert_usage(&self, rows: &[UsageRow]) -> Result<BatchOutcome, PersistError> {
        Ok(self.upsert(
            rows,
            |r| &r.team_slug,
            |r| (r.timestamp, r.environment.clone(), r.team_slug.clone(), r.app.clone(), r.resource_type),
            |s| &mut s.usage,
        ))
    }

    async fn refresh_usage_views(&self) -> Result<(), PersistError> {
        self.lock().view_refreshes += 1;
        Ok(())
    }
}
