use thiserror::Error;

/// Failures talking to the broker. All of them are treated as transient:
/// callers back off and retry, they never tear the process down.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("Broker call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Conditions that indicate a bug in the pipeline rather than an outage.
/// Logged, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogicError {
    #[error("Dispatch queue full ({capacity} entries), capacity tokens were not honoured")]
    QueueFull { capacity: usize },

    #[error("Dispatch queue closed")]
    DispatchClosed,

    #[error("Acknowledged job {job_id} had no ledger entry in {staging}")]
    DoubleAcknowledgement { job_id: String, staging: String },
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Transient broker error: {0}")]
    TransientBroker(#[from] BrokerError),

    #[error("Logic error: {0}")]
    Logic(#[from] LogicError),

    #[error("Invalid configuration: {0}")]
    FatalConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
