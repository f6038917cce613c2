use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool of capacity tokens, one per worker slot.
///
/// Fetchers take a token before contacting the broker and the token travels
/// with the claimed job until the worker slot is done with it. The number of
/// jobs held by the dispatch queue and the worker pool together can therefore
/// never exceed the pool size.
#[derive(Debug, Clone)]
pub struct Capacity {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    size: usize,
}

/// One free worker slot. Dropping it hands the slot back.
#[derive(Debug)]
pub struct CapacityToken {
    _permit: OwnedSemaphorePermit,
}

impl Capacity {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            waiting: Arc::new(AtomicUsize::new(0)),
            size,
        }
    }

    /// Wait for a free slot. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<CapacityToken> {
        let _waiting = Waiting::register(&self.waiting);
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| CapacityToken { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<CapacityToken> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| CapacityToken { _permit: permit })
    }

    /// Stop handing out tokens. Pending `acquire` calls return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers currently blocked in [`acquire`](Self::acquire).
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Tokens currently held by fetchers, the dispatch queue or workers.
    pub fn outstanding(&self) -> usize {
        self.size.saturating_sub(self.available())
    }
}

struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn register(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
