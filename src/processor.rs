use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerConnector;
use crate::capacity::Capacity;
use crate::config::ProcessorConfig;
use crate::dispatch::DispatchQueue;
use crate::error::{ProcessorError, Result};
use crate::fetcher::Fetcher;
use crate::ledger::{LedgerStats, StatsSnapshot};
use crate::scheduler::{Scheduler, Watchdog};
use crate::worker::{
    Acknowledger, JobHandler, LeaveInFlight, RetryHandoff, StatsReporter, WorkerPool,
};

/// Wires fetchers, dispatch queue, worker pool, acknowledger, housekeeping and
/// the preemption watchdog together.
///
/// Meant to run on a current-thread tokio runtime; the watchdog assumes one
/// task holds the runtime thread at a time.
pub struct Processor {
    config: ProcessorConfig,
    connector: Arc<dyn BrokerConnector>,
    handler: Arc<dyn JobHandler>,
    retry: Arc<dyn RetryHandoff>,
    scheduler: Scheduler,
    capacity: Capacity,
    dispatch: Arc<DispatchQueue>,
    stats: Arc<LedgerStats>,
    stats_tx: Option<mpsc::Sender<StatsSnapshot>>,
}

impl Processor {
    /// Validate `config` and build the shared pipeline state.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::FatalConfiguration`] when no queues are
    /// configured, the pool has no slots, or a timing value is zero.
    pub fn new(
        config: ProcessorConfig,
        connector: Arc<dyn BrokerConnector>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            scheduler: Scheduler::new(config.preemption_threshold),
            capacity: Capacity::new(config.concurrency),
            dispatch: Arc::new(DispatchQueue::new(config.concurrency)),
            stats: Arc::new(LedgerStats::new()),
            retry: Arc::new(LeaveInFlight),
            stats_tx: None,
            config,
            connector,
            handler,
        })
    }

    pub fn with_retry_handoff(mut self, retry: Arc<dyn RetryHandoff>) -> Self {
        self.retry = retry;
        self
    }

    /// Receive a [`StatsSnapshot`] every stats interval.
    pub fn with_stats_subscriber(mut self, tx: mpsc::Sender<StatsSnapshot>) -> Self {
        self.stats_tx = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<LedgerStats> {
        self.stats.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity.clone()
    }

    pub fn dispatch(&self) -> Arc<DispatchQueue> {
        self.dispatch.clone()
    }

    /// Run until `shutdown` is cancelled, then drain.
    ///
    /// Startup order:
    /// 1. Preemption watchdog thread
    /// 2. Housekeeping stats task
    /// 3. Worker slots
    /// 4. One fetcher per queue
    ///
    /// Shutdown order:
    /// 1. Fetchers stop claiming; an outstanding claim call finishes or times out
    /// 2. Dispatch queue closes; buffered jobs are left in flight
    /// 3. Worker slots finish their current job within the grace period, after
    ///    which running jobs are abandoned (their ledger entries stay)
    ///
    /// # Errors
    ///
    /// Returns an error only if the watchdog thread cannot be spawned. Broker
    /// and handler failures are dealt with inside the pipeline.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let watchdog = Watchdog::spawn(self.scheduler.clone(), self.config.watchdog_interval)
            .map_err(|e| ProcessorError::Internal(format!("failed to spawn watchdog: {e}")))?;

        tracing::info!(
            queues = self.config.queues.len(),
            concurrency = self.config.concurrency,
            threshold = ?self.config.preemption_threshold,
            "Processor starting"
        );

        // Housekeeping
        let housekeeping_stop = CancellationToken::new();
        let reporter = StatsReporter::new(self.config.stats_interval);
        let housekeeping = {
            let stats = self.stats.clone();
            let scheduler = self.scheduler.clone();
            let tx = self.stats_tx.clone();
            let stop = housekeeping_stop.clone();
            tokio::spawn(async move { reporter.run(stats, scheduler, tx, stop).await })
        };

        // Worker slots
        let acknowledger = Arc::new(Acknowledger::new(
            self.connector.clone(),
            self.config.ack_retry.clone(),
            self.stats.clone(),
            self.scheduler.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(
            self.config.concurrency,
            self.dispatch.clone(),
            self.handler.clone(),
            acknowledger,
            self.retry.clone(),
            self.stats.clone(),
            self.scheduler.clone(),
        ));
        let hard_stop = CancellationToken::new();
        let mut workers = JoinSet::new();
        pool.spawn(&mut workers, shutdown.clone(), hard_stop.clone());

        // Fetchers
        let mut fetchers = JoinSet::new();
        for queue in &self.config.queues {
            let fetcher = Fetcher::new(
                queue.clone(),
                self.connector.clone(),
                self.capacity.clone(),
                self.dispatch.clone(),
                self.stats.clone(),
                self.config.fetch_backoff.clone(),
                self.scheduler.clone(),
            );
            fetchers.spawn(fetcher.run(shutdown.clone()));
        }

        shutdown.cancelled().await;
        tracing::info!("Shutdown requested, stopping fetchers");

        join_all(&mut fetchers, "fetcher").await;

        self.capacity.close();
        self.dispatch.close();
        let left = self.dispatch.drain();
        if !left.is_empty() {
            tracing::info!(count = left.len(), "Buffered jobs left in flight for reconciliation");
        }
        drop(left);

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, join_all(&mut workers, "worker"))
            .await
            .is_err()
        {
            tracing::warn!(grace = ?grace, "Shutdown grace expired, abandoning running jobs");
            hard_stop.cancel();
            join_all(&mut workers, "worker").await;
        }

        housekeeping_stop.cancel();
        if let Err(e) = housekeeping.await {
            tracing::error!(error = %e, "Housekeeping task failed");
        }
        watchdog.stop();

        let snapshot = self.stats.snapshot();
        tracing::info!(
            claimed = snapshot.claimed,
            acknowledged = snapshot.acknowledged,
            unacknowledged = snapshot.unacknowledged(),
            "Processor stopped"
        );
        Ok(())
    }
}

async fn join_all(tasks: &mut JoinSet<()>, kind: &str) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(task = kind, error = %e, "Task ended abnormally");
        }
    }
}
