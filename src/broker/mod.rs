//! Broker abstraction.
//!
//! The processor needs exactly two primitives from the store that holds its
//! queues:
//!
//! - **pop-and-stage**: atomically move one payload from the tail of a pending
//!   list onto its staging list, blocking up to a timeout when the list is empty
//! - **remove-by-value**: delete matching payloads from a staging list
//!
//! Anything that can provide both atomically (a Redis server, a transactional
//! store, the in-process [`MemoryBroker`]) can back the processor.
//!
//! A [`BrokerConnector`] hands out [`BrokerConnection`]s. Each fetcher owns one
//! connection exclusively, so the connection count follows the number of queues
//! rather than the number of worker slots.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// One exclusive connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send {
    /// Pop a payload from the tail of `queue` and push it onto `staging` in one
    /// atomic step. Returns `None` if nothing arrived within `timeout`.
    async fn pop_and_stage(
        &mut self,
        queue: &str,
        staging: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Remove every entry equal to `payload` from `staging`. Removing an absent
    /// entry returns `Ok(0)`.
    async fn remove_value(&mut self, staging: &str, payload: &[u8]) -> Result<usize, BrokerError>;
}

/// Factory for broker connections. Reconnection after a failure is done by
/// calling [`connect`](BrokerConnector::connect) again.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}
