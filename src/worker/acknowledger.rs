use std::sync::Arc;

use tokio::sync::Mutex;

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::config::BackoffConfig;
use crate::error::{BrokerError, LogicError};
use crate::ledger::{Claim, LedgerKey, LedgerState, LedgerStats};
use crate::scheduler::Scheduler;

/// Result of an acknowledgement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ledger entry was removed.
    Removed(usize),
    /// There was nothing to remove; someone already acknowledged the job.
    AlreadyAbsent,
    /// The broker stayed unreachable; the entry is still in flight.
    Abandoned,
}

impl AckOutcome {
    pub fn ledger_state(&self, claim: &Claim) -> LedgerState {
        match self {
            AckOutcome::Removed(_) | AckOutcome::AlreadyAbsent => LedgerState::Acknowledged,
            AckOutcome::Abandoned => claim.state(),
        }
    }
}

/// Removes finished jobs from the in-flight ledger.
///
/// Shares one broker connection between all worker slots and reconnects
/// lazily after a failure.
pub struct Acknowledger {
    connector: Arc<dyn BrokerConnector>,
    conn: Mutex<Option<Box<dyn BrokerConnection>>>,
    retry: BackoffConfig,
    stats: Arc<LedgerStats>,
    scheduler: Scheduler,
}

impl Acknowledger {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        retry: BackoffConfig,
        stats: Arc<LedgerStats>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            connector,
            conn: Mutex::new(None),
            retry,
            stats,
            scheduler,
        }
    }

    /// Remove the claim's ledger entry. Idempotent: acknowledging a job whose
    /// entry is already gone is logged and otherwise ignored.
    pub async fn acknowledge(&self, claim: &Claim) -> AckOutcome {
        let job_id = claim.job().id;
        let key = claim.key();
        let mut attempts = 0u32;

        loop {
            match self.scheduler.suspend(self.remove(key)).await {
                Ok(0) => {
                    self.stats.record_double_ack();
                    let err = LogicError::DoubleAcknowledgement {
                        job_id: job_id.to_string(),
                        staging: key.staging.clone(),
                    };
                    tracing::warn!(job_id = %job_id, error = %err, "Acknowledgement found no ledger entry");
                    return AckOutcome::AlreadyAbsent;
                }
                Ok(removed) => {
                    self.stats.record_ack();
                    tracing::debug!(job_id = %job_id, staging = %key.staging, removed, "Job acknowledged");
                    return AckOutcome::Removed(removed);
                }
                Err(e) => {
                    attempts += 1;
                    if self.retry.exhausted(attempts) {
                        self.stats.record_failed_ack();
                        tracing::error!(
                            job_id = %job_id,
                            staging = %key.staging,
                            attempts,
                            error = %e,
                            "Giving up on acknowledgement, job stays in flight"
                        );
                        return AckOutcome::Abandoned;
                    }
                    let delay = self.retry.delay_for(attempts - 1);
                    tracing::warn!(
                        job_id = %job_id,
                        attempts,
                        retry_in = ?delay,
                        error = %e,
                        "Acknowledgement failed, retrying"
                    );
                    self.scheduler.suspend(tokio::time::sleep(delay)).await;
                }
            }
        }
    }

    async fn remove(&self, key: &LedgerKey) -> Result<usize, BrokerError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connector.connect().await?,
        };
        let removed = conn.remove_value(&key.staging, &key.payload).await?;
        *slot = Some(conn);
        Ok(removed)
    }
}
