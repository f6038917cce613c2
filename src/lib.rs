//! At-least-once background job processing over a list-based broker.
//!
//! Jobs travel `broker → fetcher → dispatch queue → worker → acknowledger`.
//! A job is atomically copied into its queue's in-flight ledger when claimed
//! and only removed from it once a worker has finished with it, so a crash at
//! any point leaves the job recoverable.

pub mod broker;
pub mod capacity;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod ledger;
pub mod processor;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use broker::{BrokerConnection, BrokerConnector, MemoryBroker};
pub use config::{BackoffConfig, ProcessorConfig, QueueConfig};
pub use error::{BrokerError, LogicError, ProcessorError, Result};
pub use job::{Job, Priority};
pub use processor::Processor;
pub use worker::{JobContext, JobError, JobHandler};
