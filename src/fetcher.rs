use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::capacity::{Capacity, CapacityToken};
use crate::config::{BackoffConfig, QueueConfig};
use crate::dispatch::DispatchQueue;
use crate::error::BrokerError;
use crate::job::Job;
use crate::ledger::{staging_key, Claim, LedgerKey, LedgerStats};
use crate::scheduler::Scheduler;

/// Claims jobs from one broker queue and feeds them to the dispatch queue.
///
/// Owns a single broker connection. A claim is only attempted while holding a
/// capacity token, so the fetcher never pulls more work than the worker pool
/// can take. When the token it holds was the last free one, or another fetcher
/// is queued for one, a claim blocks for the queue's contended timeout only,
/// and a fetcher whose queue came up empty steps back for that long before
/// asking again. An idle queue therefore cannot hold a worker slot hostage.
pub struct Fetcher {
    queue: QueueConfig,
    staging: String,
    connector: Arc<dyn BrokerConnector>,
    conn: Option<Box<dyn BrokerConnection>>,
    capacity: Capacity,
    dispatch: Arc<DispatchQueue>,
    stats: Arc<LedgerStats>,
    backoff: BackoffConfig,
    scheduler: Scheduler,
    failures: u32,
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: QueueConfig,
        connector: Arc<dyn BrokerConnector>,
        capacity: Capacity,
        dispatch: Arc<DispatchQueue>,
        stats: Arc<LedgerStats>,
        backoff: BackoffConfig,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            staging: staging_key(&queue.name),
            queue,
            connector,
            conn: None,
            capacity,
            dispatch,
            stats,
            backoff,
            scheduler,
            failures: 0,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    /// Claim the next job using the given capacity token.
    ///
    /// On success the payload is already in the staging list when the claim is
    /// returned. `Ok(None)` means the queue stayed empty for `timeout`; the
    /// token is released. A broker error drops the connection so the next call
    /// reconnects.
    pub async fn claim_next(
        &mut self,
        token: CapacityToken,
        timeout: Duration,
    ) -> Result<Option<Claim>, BrokerError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = self.scheduler.suspend(self.connector.connect()).await?;
                tracing::debug!(queue = %self.queue.name, "Fetcher connected to broker");
                conn
            }
        };

        let claimed = self
            .scheduler
            .suspend(conn.pop_and_stage(&self.queue.name, &self.staging, timeout))
            .await?;
        self.conn = Some(conn);

        let Some(payload) = claimed else {
            return Ok(None);
        };

        self.stats.record_claim();
        let job = Job::claimed(self.queue.name.clone(), self.queue.priority, payload.clone());
        tracing::debug!(job_id = %job.id, queue = %job.queue, "Job claimed");
        let key = LedgerKey::new(self.staging.clone(), payload);
        Ok(Some(Claim::new(job, key).with_token(token)))
    }

    /// Claim and dispatch until `shutdown` fires.
    ///
    /// Broker failures are retried forever with backoff. A claim already sent
    /// to the broker when shutdown starts is allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let scheduler = self.scheduler.clone();
        scheduler.track(self.claim_loop(shutdown)).await;
    }

    async fn claim_loop(mut self, shutdown: CancellationToken) {
        tracing::info!(queue = %self.queue.name, priority = %self.queue.priority, "Fetcher started");

        loop {
            let token = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                token = self.capacity.acquire() => match token {
                    Some(token) => token,
                    None => break,
                },
            };

            let contended = self.capacity.waiting() > 0 || self.capacity.available() == 0;
            let timeout = self.queue.claim_timeout_for(contended);

            match self.claim_next(token, timeout).await {
                Ok(Some(claim)) => {
                    self.failures = 0;
                    self.hand_off(claim);
                }
                Ok(None) => {
                    self.failures = 0;
                    if contended {
                        // Let other fetchers have the slot first
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(timeout) => {}
                        }
                    }
                }
                Err(e) => {
                    self.stats.record_stalled_claim();
                    let delay = self.backoff.delay_for(self.failures);
                    self.failures = self.failures.saturating_add(1);
                    tracing::warn!(
                        queue = %self.queue.name,
                        error = %e,
                        failures = self.failures,
                        retry_in = ?delay,
                        "Claim failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue.name, "Fetcher stopped");
    }

    fn hand_off(&self, claim: Claim) {
        let job_id = claim.job().id;
        if let Err(e) = self.dispatch.push(claim) {
            tracing::error!(
                job_id = %job_id,
                queue = %self.queue.name,
                error = %e,
                "Claimed job could not be dispatched, it stays in flight"
            );
        }
    }
}
