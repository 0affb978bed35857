use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;

use crate::{LeaseError, LeaseRecord, LeaseStore, WriteOutcome};

/// coordination.k8s.io/v1 Lease in one namespace.
#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), name: name.to_string(), namespace: namespace.to_string() }
    }
}

pub(crate) fn record_from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity,
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version.clone(),
    }
}

pub(crate) fn lease_from_record(namespace: &str, name: &str, rec: &LeaseRecord) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: rec.resource_version.clone(),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: rec.holder_identity.clone(),
            lease_duration_seconds: Some(rec.lease_duration.as_secs() as i32),
            acquire_time: rec.acquire_time.map(MicroTime),
            renew_time: rec.renew_time.map(MicroTime),
            lease_transitions: Some(rec.lease_transitions),
            ..Default::default()
        }),
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        match self.api.get(&self.name).await {
            Ok(lease) => Ok(Some(record_from_lease(&lease))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaseError> {
        let mut rec = record.clone();
        rec.resource_version = None;
        let lease = lease_from_record(&self.namespace, &self.name, &rec);
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaseError> {
        if record.resource_version.is_none() {
            return Err(LeaseError::MissingResourceVersion(self.name.clone()));
        }
        let lease = lease_from_record(&self.namespace, &self.name, record);
        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
struct Shared {
    lease: Mutex<Option<LeaseRecord>>,
    version: AtomicU64,
}

/// Process-local lease with the same compare-and-swap rules as the Kubernetes one.
///
/// [`MemoryLeaseStore::replica`] hands out views of the same lease with their own
/// partition switch, so several coordinators can compete in one process.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    shared: Arc<Shared>,
    partitioned: Arc<AtomicBool>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replica(&self) -> Self {
        Self { shared: self.shared.clone(), partitioned: Arc::new(AtomicBool::new(false)) }
    }

    /// While partitioned every call fails with [`LeaseError::Unavailable`].
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    /// Current holder, for assertions.
    pub fn holder(&self) -> Option<String> {
        self.shared.lease.lock().ok().and_then(|l| l.as_ref().and_then(|r| r.holder_identity.clone()))
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.partitioned.load(Ordering::SeqCst) {
            Err(LeaseError::Unavailable("partitioned".into()))
        } else {
            Ok(())
        }
    }

    fn next_version(&self) -> String {
        (self.shared.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        self.check()?;
        let guard = self.shared.lease.lock().map_err(|_| LeaseError::Unavailable("poisoned".into()))?;
        Ok(guard.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaseError> {
        self.check()?;
        let mut guard = self.shared.lease.lock().map_err(|_| LeaseError::Unavailable("poisoned".into()))?;
        if guard.is_some() {
            return Ok(WriteOutcome::Conflict);
        }
        let mut rec = record.clone();
        rec.resource_version = Some(self.next_version());
        *guard = Some(rec);
        Ok(WriteOutcome::Written)
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaseError> {
        self.check()?;
        let mut guard = self.shared.lease.lock().map_err(|_| LeaseError::Unavailable("poisoned".into()))?;
        let current = guard.as_ref().and_then(|r| r.resource_version.clone());
        if current.is_none() || current != record.resource_version {
            return Ok(WriteOutcome::Conflict);
        }
        let mut rec = record.clone();
        rec.resource_version = Some(self.next_version());
        *guard = Some(rec);
        Ok(WriteOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rec(holder: &str) -> LeaseRecord {
        LeaseRecord {
            holder_identity: Some(holder.into()),
            lease_duration: Duration::from_secs(15),
            acquire_time: Some(Utc::now()),
            renew_time: Some(Utc::now()),
            lease_transitions: 2,
            resource_version: Some("42".into()),
        }
    }

    #[test]
    fn lease_conversion_keeps_fields() {
        let r = rec("pod-a");
        let lease = lease_from_record("nais-system", "fleetplane", &r);
        assert_eq!(lease.metadata.name.as_deref(), Some("fleetplane"));
        assert_eq!(lease.spec.as_ref().and_then(|s| s.lease_duration_seconds), Some(15));
        let back = record_from_lease(&lease);
        assert_eq!(back.holder_identity, r.holder_identity);
        assert_eq!(back.lease_transitions, 2);
        assert_eq!(back.resource_version.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn memory_store_is_compare_and_swap() {
        let store = MemoryLeaseStore::new();
        assert_eq!(store.create(&rec("a")).await.unwrap(), WriteOutcome::Written);
        assert_eq!(store.create(&rec("b")).await.unwrap(), WriteOutcome::Conflict);

        let read = store.get().await.unwrap().unwrap();
        let mut stale = read.clone();
        stale.resource_version = Some("0".into());
        assert_eq!(store.replace(&stale).await.unwrap(), WriteOutcome::Conflict);

        let mut next = read.clone();
        next.holder_identity = Some("b".into());
        assert_eq!(store.replace(&next).await.unwrap(), WriteOutcome::Written);
        // the same read version cannot be used twice
        assert_eq!(store.replace(&read).await.unwrap(), WriteOutcome::Conflict);
        assert_eq!(store.holder().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn partitioned_replica_fails_others_do_not() {
        let store = MemoryLeaseStore::new();
        let other = store.replica();
        other.set_partitioned(true);
        assert!(other.get().await.is_err());
        assert!(store.get().await.unwrap().is_none());
    }
}
