use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::LogicError;
use crate::job::Priority;
use crate::ledger::Claim;

/// Bounded hand-off buffer between fetchers and worker slots.
///
/// Entries come out highest priority first, earliest arrival first among equal
/// priorities. Every entry is returned to exactly one caller.
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<State>,
    available: Notify,
    capacity: usize,
}

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
struct Entry {
    priority: Priority,
    seq: u64,
    claim: Claim,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the lower sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            capacity,
        }
    }

    /// Buffer a claimed job. On error the claim is dropped here, which
    /// releases its capacity token but leaves its ledger entry untouched.
    pub fn push(&self, claim: Claim) -> Result<(), LogicError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(LogicError::DispatchClosed);
            }
            if state.heap.len() >= self.capacity {
                return Err(LogicError::QueueFull {
                    capacity: self.capacity,
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry {
                priority: claim.job().priority,
                seq,
                claim,
            });
        }
        self.available.notify_one();
        Ok(())
    }

    /// Wait for the highest priority entry. Returns `None` once the queue is
    /// closed; entries still buffered at that point are left for
    /// [`drain`](Self::drain).
    pub async fn pop_highest_priority(&self) -> Option<Claim> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.claim);
                }
            }

            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Claim> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.heap.pop().map(|entry| entry.claim)
    }

    /// Stop accepting and handing out entries and wake every waiting worker.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Remove everything still buffered, highest priority first.
    pub fn drain(&self) -> Vec<Claim> {
        let mut state = self.lock();
        let mut claims = Vec::with_capacity(state.heap.len());
        while let Some(entry) = state.heap.pop() {
            claims.push(entry.claim);
        }
        claims
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
