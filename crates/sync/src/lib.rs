//! fleetplane sync: leader-gated importers that move cluster events, cost and
//! resource usage into the store.
//!
//! Every importer runs on the same cycle: skip unless leading, check the
//! idempotence guard, then stream rows from a producer into batched upserts over a
//! bounded channel, and finish with post-processing.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetplane_leader::LeaderCoordinator;

pub mod cost;
pub mod events;
mod schedule;
pub mod sources;
pub mod usage;

pub use cost::{CostImporter, CostWarehouse};
pub use events::{default_classifiers, EventIngester, HpaRescaleClassifier, LivenessProbeClassifier, NoteClassifier};
pub use schedule::{budget_for, Importer, RunReport, ScheduledSynchronizer, TickOutcome};
pub use usage::{MetricsBackend, Series, UsageImporter};

/// Wall clock used by the idempotence guards.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Read side of leadership, as seen by the schedulers.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

impl Leadership for LeaderCoordinator {
    fn is_leader(&self) -> bool {
        LeaderCoordinator::is_leader(self)
    }
}

impl Leadership for AtomicBool {
    fn is_leader(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}
