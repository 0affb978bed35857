//! fleetplane core types shared by the cache, the synchronizers and the store.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

pub mod selector;

pub use selector::{LabelSelector, SelectorError};

/// Kubernetes labels as key/value pairs.
pub type Labels = SmallVec<[(String, String); 8]>;

/// Namespace owned by the platform itself. Objects and events from it are never mirrored.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "nais-system";

/// The principal on whose behalf a write is performed.
///
/// Writes through the cache are impersonated as this user and groups so that the
/// cluster audit log and admission policies see the real actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: String,
    pub groups: Vec<String>,
}

impl Actor {
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self { user: user.into(), groups }
    }
}

/// A classified Kubernetes event ready to be persisted.
///
/// `uid` is the UID of the source event, so writing the same event twice converges
/// on one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFact {
    pub uid: Uuid,
    pub environment_name: String,
    pub involved_kind: String,
    pub involved_name: String,
    pub involved_namespace: String,
    pub reason: String,
    pub data: serde_json::Value,
    pub triggered_at: Option<DateTime<Utc>>,
}

/// One day of cost for one (environment, team, app, cost type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRow {
    pub environment: Option<String>,
    pub team_slug: String,
    pub app: String,
    pub cost_type: String,
    pub date: NaiveDate,
    pub daily_cost: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Cpu, ResourceType::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hourly usage and request sample for one (environment, team, app, resource type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub timestamp: DateTime<Utc>,
    pub environment: String,
    pub team_slug: String,
    pub app: String,
    pub resource_type: ResourceType,
    pub usage: f64,
    pub request: f64,
}
