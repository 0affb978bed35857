use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetplane_persist::BatchOutcome;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Leadership;

const BUDGET_MARGIN: Duration = Duration::from_secs(5 * 60);
const FIRST_TICK: Duration = Duration::from_secs(1);

/// Time a tick may spend producing and upserting.
pub fn budget_for(schedule: Duration) -> Duration {
    if schedule > BUDGET_MARGIN {
        schedule - BUDGET_MARGIN
    } else {
        schedule
    }
}

/// One periodic import: a producer of rows and the store side that persists them.
#[async_trait]
pub trait Importer: Send + Sync + 'static {
    type Row: Send + 'static;

    fn name(&self) -> &'static str;

    /// Rows per upsert call. The channel between producer and consumer holds two batches.
    fn batch_size(&self) -> usize;

    /// Idempotence guard. `false` means the data is already current.
    async fn should_run(&self) -> anyhow::Result<bool>;

    /// Stream rows into `tx`. Dropping `tx` closes the channel.
    async fn produce(&self, tx: mpsc::Sender<Self::Row>) -> anyhow::Result<()>;

    async fn upsert(&self, batch: &[Self::Row]) -> anyhow::Result<BatchOutcome>;

    async fn post_process(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub upserted: usize,
    pub failed: usize,
    pub producer_error: Option<String>,
    pub post_process_error: Option<String>,
    pub timed_out: bool,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.producer_error.is_none() && self.post_process_error.is_none() && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    SkippedNotLeader,
    SkippedNotDue,
    GuardFailed(String),
    Ran(RunReport),
}

/// Drives an [`Importer`] on a fixed schedule, only on the leader.
pub struct ScheduledSynchronizer<I: Importer> {
    importer: Arc<I>,
    leader: Arc<dyn Leadership>,
    schedule: Duration,
    first_tick: Duration,
}

impl<I: Importer> ScheduledSynchronizer<I> {
    pub fn new(importer: I, leader: Arc<dyn Leadership>, schedule: Duration) -> Self {
        Self { importer: Arc::new(importer), leader, schedule, first_tick: FIRST_TICK }
    }

    pub fn first_tick(mut self, after: Duration) -> Self {
        self.first_tick = after;
        self
    }

    pub fn importer(&self) -> &I {
        &self.importer
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let task = self.importer.name();
            info!(task, schedule_secs = self.schedule.as_secs(), "synchronizer started");
            let start = tokio::time::Instant::now() + self.first_tick;
            let mut ticker = tokio::time::interval_at(start, self.schedule);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.tick() => {}
                }
            }
            info!(task, "synchronizer stopped");
        })
    }

    pub async fn tick(&self) -> TickOutcome {
        let task = self.importer.name();
        if !self.leader.is_leader() {
            debug!(task, "not leader, skipping");
            return TickOutcome::SkippedNotLeader;
        }
        match self.importer.should_run().await {
            Ok(true) => {}
            Ok(false) => {
                info!(task, "data is current, skipping");
                return TickOutcome::SkippedNotDue;
            }
            Err(e) => {
                error!(task, error = %e, "unable to check if import is due");
                counter!("sync_runs_total", 1u64, "task" => task, "success" => "false");
                return TickOutcome::GuardFailed(e.to_string());
            }
        }

        let started = Instant::now();
        let budget = budget_for(self.schedule);
        let batch_size = self.importer.batch_size().max(1);
        let (tx, rx) = mpsc::channel(batch_size.saturating_mul(2));
        let mut consumer = tokio::spawn(consume(self.importer.clone(), rx, batch_size));
        let mut report = RunReport::default();

        match tokio::time::timeout(budget, self.importer.produce(tx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(task, error = %e, "producer failed");
                report.producer_error = Some(e.to_string());
            }
            Err(_) => {
                warn!(task, budget_secs = budget.as_secs(), "producer ran out of time");
                report.timed_out = true;
            }
        }

        let remaining = budget.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, &mut consumer).await {
            Ok(Ok(out)) => {
                report.upserted = out.upserted;
                report.failed = out.failed.len();
            }
            Ok(Err(e)) => error!(task, error = %e, "consumer task failed"),
            Err(_) => {
                consumer.abort();
                warn!(task, "consumer ran out of time");
                report.timed_out = true;
            }
        }

        if let Err(e) = self.importer.post_process().await {
            warn!(task, error = %e, "post-processing failed");
            report.post_process_error = Some(e.to_string());
        }

        let elapsed = started.elapsed();
        histogram!("sync_run_ms", elapsed.as_secs_f64() * 1000.0, "task" => task);
        counter!("sync_runs_total", 1u64, "task" => task, "success" => report.success().to_string());
        info!(
            task,
            duration_ms = elapsed.as_millis() as u64,
            num_rows = report.upserted,
            num_errors = report.failed,
            "import finished"
        );
        TickOutcome::Ran(report)
    }
}

async fn consume<I: Importer>(importer: Arc<I>, mut rx: mpsc::Receiver<I::Row>, batch_size: usize) -> BatchOutcome {
    let task = importer.name();
    let mut total = BatchOutcome::default();
    loop {
        let batch = next_batch(&mut rx, batch_size).await;
        if batch.is_empty() {
            break;
        }
        let started = Instant::now();
        match importer.upsert(&batch).await {
            Ok(out) => {
                for (row, err) in &out.failed {
                    warn!(task, row, error = %err, "row upsert failed");
                }
                debug!(
                    task,
                    duration_ms = started.elapsed().as_millis() as u64,
                    num_rows = out.upserted,
                    num_errors = out.failed.len(),
                    "upserted batch"
                );
                total.merge(out);
            }
            Err(e) => {
                error!(task, num_rows = batch.len(), error = %e, "batch upsert failed");
                let msg = e.to_string();
                total.merge(BatchOutcome { upserted: 0, failed: (0..batch.len()).map(|i| (i, msg.clone())).collect() });
            }
        }
    }
    total
}

/// Collect up to `n` rows. Returns early, possibly empty, once the channel is closed.
async fn next_batch<T>(rx: &mut mpsc::Receiver<T>, n: usize) -> Vec<T> {
    let mut batch = Vec::new();
    while batch.len() < n {
        match rx.recv().await {
            Some(row) => batch.push(row),
            None => break,
        }
    }
    batch
}
