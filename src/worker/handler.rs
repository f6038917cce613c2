use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job::Job;
use crate::ledger::Claim;
use crate::scheduler::Scheduler;

/// Error returned by a job handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Worth running again later. The ledger entry is kept for the retry path.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Will never succeed. The job is acknowledged and dropped.
    #[error("terminal failure: {0}")]
    Terminal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Terminal,
}

/// Result of executing one job, as reported by a worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { kind: FailureKind, reason: String },
}

impl Outcome {
    pub fn terminal(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            kind: FailureKind::Terminal,
            reason: reason.into(),
        }
    }

    /// Whether the ledger entry should be removed for this outcome.
    pub fn acknowledges(&self) -> bool {
        !matches!(
            self,
            Outcome::Failure {
                kind: FailureKind::Retryable,
                ..
            }
        )
    }
}

impl From<Result<(), JobError>> for Outcome {
    fn from(result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(JobError::Retryable(reason)) => Outcome::Failure {
                kind: FailureKind::Retryable,
                reason,
            },
            Err(JobError::Terminal(reason)) => Outcome::terminal(reason),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure {
                kind: FailureKind::Retryable,
                ..
            } => write!(f, "retryable failure"),
            Outcome::Failure {
                kind: FailureKind::Terminal,
                ..
            } => write!(f, "terminal failure"),
        }
    }
}

/// What a handler gets to see besides the job itself.
#[derive(Debug, Clone)]
pub struct JobContext {
    scheduler: Scheduler,
    shutdown: CancellationToken,
    slot: usize,
}

impl JobContext {
    pub fn new(scheduler: Scheduler, shutdown: CancellationToken, slot: usize) -> Self {
        Self {
            scheduler,
            shutdown,
            slot,
        }
    }

    /// Call regularly from CPU-bound code. Yields when the watchdog has asked
    /// for preemption, otherwise returns immediately.
    pub async fn checkpoint(&self) {
        self.scheduler.checkpoint().await;
    }

    /// Await an external operation (I/O, timers) as a blocking point. Handlers
    /// run as tracked tasks, so a plain `.await` is recorded the same way; this
    /// is for helpers that may also run outside a worker.
    pub async fn suspend<F: Future>(&self, fut: F) -> F::Output {
        self.scheduler.suspend(fut).await
    }

    /// Set once the processor has started shutting down. Long jobs may use it
    /// to stop early; they are aborted after the grace period anyway.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// Application code executed for every claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn perform(&self, job: &Job, ctx: &JobContext) -> Result<(), JobError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn perform(&self, job: &Job, ctx: &JobContext) -> Result<(), JobError> {
        (self.f)(job.clone(), ctx.clone()).await
    }
}

/// Receives jobs that failed with a retryable error. The claim is still in the
/// ledger when this is called; moving it to a retry schedule is up to the
/// implementation.
#[async_trait]
pub trait RetryHandoff: Send + Sync + 'static {
    async fn hand_off(&self, claim: &Claim, reason: &str);
}

/// Default hand-off: keep the ledger entry and let reconciliation pick it up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveInFlight;

#[async_trait]
impl RetryHandoff for LeaveInFlight {
    async fn hand_off(&self, claim: &Claim, reason: &str) {
        tracing::info!(
            job_id = %claim.job().id,
            queue = %claim.job().queue,
            reason,
            "Job failed, leaving it in flight for reconciliation"
        );
    }
}
