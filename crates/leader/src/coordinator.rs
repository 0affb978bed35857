use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{LeaseError, LeaseRecord, LeaseStore, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionParams {
    pub lease_duration: Duration,
    /// A leader that has not renewed for this long steps down.
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for ElectionParams {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Pod hostname plus a random suffix, so restarted pods never reuse an identity.
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| "fleetplane".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

type StartedFn = Arc<dyn Fn(CancellationToken) + Send + Sync>;
type StoppedFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    started: Vec<StartedFn>,
    stopped: Vec<StoppedFn>,
    /// Token of the current term; `Some` exactly while leading.
    term: Option<CancellationToken>,
}

/// Single-writer election among replicas sharing one lease.
pub struct LeaderCoordinator {
    identity: String,
    params: ElectionParams,
    store: Arc<dyn LeaseStore>,
    leading: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl LeaderCoordinator {
    pub fn new(identity: impl Into<String>, store: Arc<dyn LeaseStore>, params: ElectionParams) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            params,
            store,
            leading: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    /// Called with a token that is cancelled when the term ends. Registering while
    /// already leading invokes `f` right away with the current term's token.
    pub fn on_started_leading<F>(&self, f: F)
    where
        F: Fn(CancellationToken) + Send + Sync + 'static,
    {
        let f: StartedFn = Arc::new(f);
        let current = {
            let Ok(mut cbs) = self.callbacks.lock() else { return };
            cbs.started.push(f.clone());
            cbs.term.clone()
        };
        if let Some(token) = current {
            f(token);
        }
    }

    pub fn on_stopped_leading<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut cbs) = self.callbacks.lock() {
            cbs.stopped.push(Arc::new(f));
        }
    }

    /// Run the acquire/renew loop until `cancel` fires. On cancel a held lease is released.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) {
        info!(identity = %self.identity, "leader election started");
        gauge!("leader_is_leader", 0.0);
        let mut ticker = tokio::time::interval(self.params.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_renew: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // The deadline counts from the start of the last successful attempt,
            // which is the renew time written to the lease.
            let started = Instant::now();
            let budget = match last_renew {
                Some(t) if self.is_leader() => self.params.renew_deadline.saturating_sub(t.elapsed()),
                _ => self.params.renew_deadline,
            };
            let attempt = tokio::time::timeout(budget, self.try_acquire_or_renew(Utc::now()));
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                r = attempt => r.unwrap_or(Err(LeaseError::Timeout(budget))),
            };
            match res {
                Ok(true) => {
                    last_renew = Some(started);
                    if !self.is_leader() {
                        self.become_leader(&cancel);
                    }
                }
                Ok(false) => {
                    if self.is_leader() {
                        warn!(identity = %self.identity, "lease taken by another replica");
                        self.step_down();
                    }
                }
                Err(e) => {
                    let overdue = last_renew.map_or(true, |t| t.elapsed() >= self.params.renew_deadline);
                    if self.is_leader() && overdue {
                        warn!(identity = %self.identity, error = %e, "failed to renew lease before deadline");
                        self.step_down();
                    } else {
                        debug!(identity = %self.identity, error = %e, "lease attempt failed, retrying");
                    }
                }
            }
        }
        if self.is_leader() {
            self.step_down();
            if let Err(e) = self.release().await {
                warn!(identity = %self.identity, error = %e, "failed to release lease");
            }
        }
        info!(identity = %self.identity, "leader election stopped");
    }

    fn become_leader(&self, parent: &CancellationToken) {
        let token = parent.child_token();
        let started = {
            let Ok(mut cbs) = self.callbacks.lock() else { return };
            cbs.term = Some(token.clone());
            self.leading.store(true, Ordering::SeqCst);
            cbs.started.clone()
        };
        info!(identity = %self.identity, "started leading");
        gauge!("leader_is_leader", 1.0);
        counter!("leader_transitions_total", 1u64);
        for f in started {
            f(token.clone());
        }
    }

    fn step_down(&self) {
        let (term, stopped) = {
            let Ok(mut cbs) = self.callbacks.lock() else {
                self.leading.store(false, Ordering::SeqCst);
                return;
            };
            self.leading.store(false, Ordering::SeqCst);
            (cbs.term.take(), cbs.stopped.clone())
        };
        if let Some(t) = term {
            t.cancel();
        }
        info!(identity = %self.identity, "stopped leading");
        gauge!("leader_is_leader", 0.0);
        counter!("leader_transitions_total", 1u64);
        for f in stopped {
            f();
        }
    }

    /// One election round. `Ok(true)` means we hold the lease after this call.
    async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let Some(current) = self.store.get().await? else {
            let rec = LeaseRecord {
                holder_identity: Some(self.identity.clone()),
                lease_duration: self.params.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
                resource_version: None,
            };
            return Ok(self.store.create(&rec).await? == WriteOutcome::Written);
        };

        let next = if current.is_held_by(&self.identity) {
            LeaseRecord { renew_time: Some(now), lease_duration: self.params.lease_duration, ..current }
        } else if current.is_expired(now) {
            debug!(identity = %self.identity, previous = ?current.holder_identity, "taking over expired lease");
            LeaseRecord {
                holder_identity: Some(self.identity.clone()),
                lease_duration: self.params.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: current.lease_transitions + 1,
                resource_version: current.resource_version,
            }
        } else {
            return Ok(false);
        };
        Ok(self.store.replace(&next).await? == WriteOutcome::Written)
    }

    async fn release(&self) -> Result<(), LeaseError> {
        let Some(current) = self.store.get().await? else { return Ok(()) };
        if !current.is_held_by(&self.identity) {
            return Ok(());
        }
        let released = LeaseRecord { holder_identity: None, renew_time: Some(Utc::now()), ..current };
        self.store.replace(&released).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLeaseStore;
    use std::sync::atomic::AtomicUsize;

    fn fast() -> ElectionParams {
        ElectionParams {
            lease_duration: Duration::from_millis(400),
            renew_deadline: Duration::from_millis(200),
            retry_period: Duration::from_millis(50),
        }
    }

    async fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn not_leader_before_start() {
        let c = LeaderCoordinator::new("a", Arc::new(MemoryLeaseStore::new()), fast());
        assert!(!c.is_leader());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callbacks_fire_once_per_transition_and_release_on_cancel() {
        let store = MemoryLeaseStore::new();
        let c = LeaderCoordinator::new("a", Arc::new(store.clone()), fast());
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let term_cancelled = Arc::new(AtomicBool::new(false));
        {
            let started = started.clone();
            let term_cancelled = term_cancelled.clone();
            c.on_started_leading(move |token| {
                started.fetch_add(1, Ordering::SeqCst);
                let term_cancelled = term_cancelled.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    term_cancelled.store(true, Ordering::SeqCst);
                });
            });
        }
        {
            let stopped = stopped.clone();
            c.on_stopped_leading(move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        let cancel = CancellationToken::new();
        let handle = c.start(cancel.clone());
        assert!(wait_for(|| c.is_leader()).await);
        // several renew rounds must not re-fire the start callback
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert!(!c.is_leader());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(wait_for(|| term_cancelled.load(Ordering::SeqCst)).await);
        assert_eq!(store.holder(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_registration_sees_current_term() {
        let c = LeaderCoordinator::new("a", Arc::new(MemoryLeaseStore::new()), fast());
        let cancel = CancellationToken::new();
        let handle = c.start(cancel.clone());
        assert!(wait_for(|| c.is_leader()).await);

        let got = Arc::new(AtomicBool::new(false));
        let g = got.clone();
        c.on_started_leading(move |token| g.store(!token.is_cancelled(), Ordering::SeqCst));
        assert!(got.load(Ordering::SeqCst));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn steps_down_when_store_unreachable() {
        let store = MemoryLeaseStore::new();
        let c = LeaderCoordinator::new("a", Arc::new(store.clone()), fast());
        let cancel = CancellationToken::new();
        let handle = c.start(cancel.clone());
        assert!(wait_for(|| c.is_leader()).await);
        store.set_partitioned(true);
        assert!(wait_for(|| !c.is_leader()).await);
        store.set_partitioned(false);
        assert!(wait_for(|| c.is_leader()).await);
        cancel.cancel();
        handle.await.unwrap();
    }
}
