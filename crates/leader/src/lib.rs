//! fleetplane leader: elects one writer among service replicas.
//!
//! A [`LeaderCoordinator`] runs an acquire/renew loop against a [`LeaseStore`]
//! and flips a cached flag plus registered callbacks on every transition.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod coordinator;
mod store;

pub use coordinator::{default_identity, ElectionParams, LeaderCoordinator};
pub use store::{KubeLeaseStore, MemoryLeaseStore};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
    #[error("lease store unreachable: {0}")]
    Unavailable(String),
    #[error("lease operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Snapshot of the lease as last read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
    /// Version the record was read at; writes succeed only if it is still current.
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// A lease without a renew time or holder counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.holder_identity.as_deref().map_or(true, str::is_empty) {
            return true;
        }
        match self.renew_time {
            Some(rt) => {
                let ttl = chrono::Duration::from_std(self.lease_duration).unwrap_or(chrono::Duration::zero());
                rt + ttl < now
            }
            None => true,
        }
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }
}

/// Result of a conditional lease write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Someone else created or changed the lease first.
    Conflict,
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError>;
    async fn create(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaseError>;
    /// Compare-and-swap on `record.resource_version`.
    async fn replace(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaseError>;
}
