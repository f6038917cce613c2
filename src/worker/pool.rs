use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchQueue;
use crate::ledger::{Claim, LedgerStats};
use crate::scheduler::Scheduler;
use crate::worker::acknowledger::{AckOutcome, Acknowledger};
use crate::worker::handler::{FailureKind, JobContext, JobHandler, Outcome, RetryHandoff};

/// Fixed set of worker slots pulling from the dispatch queue.
///
/// Each slot loops: take the highest priority job, run the handler in its own
/// task, report the outcome, acknowledge, give the capacity token back. A
/// handler that panics only fails its job; the slot keeps going.
pub struct WorkerPool {
    size: usize,
    dispatch: Arc<DispatchQueue>,
    handler: Arc<dyn JobHandler>,
    acknowledger: Arc<Acknowledger>,
    retry: Arc<dyn RetryHandoff>,
    stats: Arc<LedgerStats>,
    scheduler: Scheduler,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        dispatch: Arc<DispatchQueue>,
        handler: Arc<dyn JobHandler>,
        acknowledger: Arc<Acknowledger>,
        retry: Arc<dyn RetryHandoff>,
        stats: Arc<LedgerStats>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            size,
            dispatch,
            handler,
            acknowledger,
            retry,
            stats,
            scheduler,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawn every slot onto `tasks`.
    ///
    /// `shutdown` stops slots from taking new jobs; `hard_stop` aborts the job
    /// a slot is running, leaving its ledger entry in place.
    pub fn spawn(
        self: Arc<Self>,
        tasks: &mut JoinSet<()>,
        shutdown: CancellationToken,
        hard_stop: CancellationToken,
    ) {
        for slot in 0..self.size {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let hard_stop = hard_stop.clone();
            let scheduler = pool.scheduler.clone();
            tasks.spawn(scheduler.track(async move {
                pool.run_slot(slot, shutdown, hard_stop).await
            }));
        }
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken, hard_stop: CancellationToken) {
        tracing::debug!(slot, "Worker slot started");

        loop {
            let claim = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.dispatch.pop_highest_priority() => match next {
                    Some(claim) => claim,
                    None => break,
                },
            };

            if !self.process(slot, claim, &shutdown, &hard_stop).await {
                break;
            }
        }

        tracing::debug!(slot, "Worker slot retired");
    }

    /// Run one job to completion. Returns `false` if the slot was told to stop
    /// while the job was running.
    async fn process(
        &self,
        slot: usize,
        claim: Claim,
        shutdown: &CancellationToken,
        hard_stop: &CancellationToken,
    ) -> bool {
        let job = claim.job().clone();
        let job_id = job.id;
        let ctx = JobContext::new(self.scheduler.clone(), shutdown.clone(), slot);
        let handler = self.handler.clone();

        tracing::debug!(job_id = %job_id, queue = %job.queue, priority = %job.priority, slot, "Executing job");

        // Own task, so a panic only fails this job
        let mut execution =
            tokio::spawn(self.scheduler.track(async move { handler.perform(&job, &ctx).await }));

        let joined = tokio::select! {
            joined = &mut execution => joined,
            _ = hard_stop.cancelled() => {
                execution.abort();
                self.stats.record_abandoned();
                tracing::warn!(
                    job_id = %job_id,
                    slot,
                    "Shutdown grace expired, abandoning job; it stays in flight"
                );
                return false;
            }
        };

        let outcome = match joined {
            Ok(result) => Outcome::from(result),
            Err(e) if e.is_panic() => {
                self.stats.record_panic();
                tracing::error!(job_id = %job_id, slot, "Job handler panicked");
                Outcome::terminal("handler panicked")
            }
            Err(e) => Outcome::terminal(e.to_string()),
        };

        self.report(&claim, &outcome).await;
        // Dropping the claim hands the capacity token back
        drop(claim);
        true
    }

    async fn report(&self, claim: &Claim, outcome: &Outcome) {
        let job = claim.job();
        match outcome {
            Outcome::Success => {
                self.stats.record_success();
                tracing::debug!(job_id = %job.id, queue = %job.queue, "Job succeeded");
            }
            Outcome::Failure { kind, reason } => {
                self.stats.record_failure();
                tracing::warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    outcome = %outcome,
                    reason = %reason,
                    "Job failed"
                );
                if *kind == FailureKind::Retryable {
                    self.stats.record_retry_handoff();
                    self.retry.hand_off(claim, reason).await;
                }
            }
        }

        if outcome.acknowledges() {
            if let AckOutcome::Abandoned = self.acknowledger.acknowledge(claim).await {
                tracing::warn!(job_id = %job.id, "Job finished but remains in the ledger");
            }
        }
    }
}
