//! Worker side of the pipeline.
//!
//! - [`WorkerPool`]: fixed number of slots executing claimed jobs
//! - [`JobHandler`]: application code run for each job, with [`JobContext`]
//! - [`Acknowledger`]: removes finished jobs from the in-flight ledger
//! - [`RetryHandoff`]: where retryable failures go; [`LeaveInFlight`] by default
//! - [`StatsReporter`]: housekeeping task emitting pipeline counters
//!
//! # Execution Flow
//!
//! 1. A slot pops the highest priority claim from the dispatch queue
//! 2. The handler runs in its own task so a panic cannot take the slot down
//! 3. Success and terminal failures are acknowledged; retryable failures are
//!    handed off and stay in the ledger
//! 4. The claim is dropped, returning its capacity token to the fetchers

pub mod acknowledger;
pub mod handler;
pub mod housekeeping;
pub mod pool;

pub use acknowledger::{AckOutcome, Acknowledger};
pub use handler::{
    handler_fn, FailureKind, JobContext, JobError, JobHandler, LeaveInFlight, Outcome,
    RetryHandoff,
};
pub use housekeeping::StatsReporter;
pub use pool::WorkerPool;
