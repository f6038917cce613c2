use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::error::BrokerError;

/// In-process broker with list semantics matching `LPUSH`/`BRPOPLPUSH`/`LREM`.
///
/// Cloning shares the same store. Used by the test suite and for local runs;
/// it also supports fault injection so broker outages can be simulated.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    pushed: Notify,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    connects: AtomicU64,
    claim_calls: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a payload at the head of `queue` (`LPUSH`).
    pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.lists()
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.into());
        self.inner.pushed.notify_waiters();
    }

    pub fn len(&self, key: &str) -> usize {
        self.lists().get(key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    pub fn contains(&self, key: &str, payload: &[u8]) -> bool {
        self.lists()
            .get(key)
            .is_some_and(|list| list.iter().any(|p| p.as_slice() == payload))
    }

    /// Snapshot of a list, head first.
    pub fn entries(&self, key: &str) -> Vec<Vec<u8>> {
        self.lists()
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every connect and command fail until switched back.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` commands with a dropped connection.
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful `connect` calls so far.
    pub fn connects(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of pop-and-stage commands issued so far.
    pub fn claim_calls(&self) -> u64 {
        self.inner.claim_calls.load(Ordering::SeqCst)
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Vec<u8>>>> {
        // A panic while holding the lock cannot leave a list half-modified:
        // every mutation is a single push or pop.
        self.inner
            .lists
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fault(&self) -> Result<(), BrokerError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".to_string()));
        }
        let injected = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BrokerError::ConnectionLost("injected fault".to_string()));
        }
        Ok(())
    }

    fn try_pop_and_stage(&self, queue: &str, staging: &str) -> Option<Vec<u8>> {
        let mut lists = self.lists();
        let payload = lists.get_mut(queue)?.pop_back()?;
        lists
            .entry(staging.to_string())
            .or_default()
            .push_front(payload.clone());
        Some(payload)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn pop_and_stage(
        &mut self,
        queue: &str,
        staging: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, BrokerError> {
        self.broker.inner.claim_calls.fetch_add(1, Ordering::SeqCst);
        self.broker.check_fault()?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pushed = self.broker.inner.pushed.notified();
            tokio::pin!(pushed);
            // Register before looking so a push between the check and the wait
            // is not missed.
            pushed.as_mut().enable();

            if let Some(payload) = self.broker.try_pop_and_stage(queue, staging) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove_value(&mut self, staging: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        self.broker.check_fault()?;
        let mut lists = self.broker.lists();
        let Some(list) = lists.get_mut(staging) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|entry| entry.as_slice() != payload);
        Ok(before - list.len())
    }
}
