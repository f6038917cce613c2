use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ledger::{LedgerStats, StatsSnapshot};
use crate::scheduler::Scheduler;

/// Periodically emits pipeline counters.
///
/// This is the kind of background task the preemption watchdog protects: it
/// only makes progress when job handlers give the thread back.
pub struct StatsReporter {
    interval: Duration,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run until `shutdown` fires, logging a snapshot every interval and
    /// forwarding it to `subscriber` when one is attached.
    pub async fn run(
        &self,
        stats: Arc<LedgerStats>,
        scheduler: Scheduler,
        subscriber: Option<mpsc::Sender<StatsSnapshot>>,
        shutdown: CancellationToken,
    ) {
        scheduler
            .track(self.report_loop(stats, scheduler.clone(), subscriber, shutdown))
            .await;
    }

    async fn report_loop(
        &self,
        stats: Arc<LedgerStats>,
        scheduler: Scheduler,
        mut subscriber: Option<mpsc::Sender<StatsSnapshot>>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let snapshot = stats.snapshot();
            tracing::info!(
                claimed = snapshot.claimed,
                acknowledged = snapshot.acknowledged,
                unacknowledged = snapshot.unacknowledged(),
                stalled_claims = snapshot.stalled_claims,
                failed_acks = snapshot.failed_acks,
                forced_preemptions = scheduler.forced_preemptions(),
                "Processor stats"
            );

            if let Some(tx) = &subscriber {
                match tx.try_send(snapshot) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        // Receiver dropped, keep logging only
                        subscriber = None;
                    }
                }
            }
        }
    }
}
