//! In-flight ledger bookkeeping.
//!
//! The ledger itself lives in the broker: every pending list `<queue>` has a
//! staging list `<queue>:inflight` that the claim primitive fills atomically.
//! This module names those lists, models the per-job transition
//!
//! ```text
//! Pending ──claim──▶ Claimed(LedgerKey) ──acknowledge──▶ Acknowledged
//! ```
//!
//! and keeps process-local counters of what went through each step.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::capacity::CapacityToken;
use crate::job::Job;

const STAGING_SUFFIX: &str = ":inflight";

/// Name of the staging list holding `queue`'s in-flight entries.
pub fn staging_key(queue: &str) -> String {
    format!("{queue}{STAGING_SUFFIX}")
}

/// Identifies a ledger entry: the staging list plus the exact payload bytes.
/// This is all an acknowledgement needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub staging: String,
    pub payload: Vec<u8>,
}

impl LedgerKey {
    pub fn new(staging: String, payload: Vec<u8>) -> Self {
        Self { staging, payload }
    }
}

/// Where a job is in the ledger protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerState {
    Pending,
    Claimed(LedgerKey),
    Acknowledged,
}

/// A job that exists in the ledger and has not been acknowledged yet.
///
/// Only the fetcher creates claims, and only after the broker has staged the
/// payload. Dropping a claim without acknowledging it leaves the ledger entry
/// in place for reconciliation.
#[derive(Debug)]
pub struct Claim {
    job: Job,
    key: LedgerKey,
    token: Option<CapacityToken>,
}

impl Claim {
    pub fn new(job: Job, key: LedgerKey) -> Self {
        Self {
            job,
            key,
            token: None,
        }
    }

    pub fn with_token(mut self, token: CapacityToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    pub fn state(&self) -> LedgerState {
        LedgerState::Claimed(self.key.clone())
    }

    pub fn holds_token(&self) -> bool {
        self.token.is_some()
    }

    /// Hand the capacity token back without giving up the claim.
    pub fn release_token(&mut self) {
        self.token = None;
    }
}

/// Process-local counters for the claim/ack pipeline.
#[derive(Debug, Default)]
pub struct LedgerStats {
    claimed: AtomicU64,
    acknowledged: AtomicU64,
    double_acks: AtomicU64,
    failed_acks: AtomicU64,
    stalled_claims: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retry_handoffs: AtomicU64,
    panics: AtomicU64,
    abandoned: AtomicU64,
}

/// Point-in-time copy of [`LedgerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub claimed: u64,
    pub acknowledged: u64,
    pub double_acks: u64,
    pub failed_acks: u64,
    pub stalled_claims: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retry_handoffs: u64,
    pub panics: u64,
    pub abandoned: u64,
}

impl StatsSnapshot {
    /// Claims this process made that are neither acknowledged nor handed to
    /// reconciliation.
    pub fn unacknowledged(&self) -> u64 {
        self.claimed
            .saturating_sub(self.acknowledged + self.double_acks)
    }
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl LedgerStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_claim, claimed);
    counter!(record_ack, acknowledged);
    counter!(record_double_ack, double_acks);
    counter!(record_failed_ack, failed_acks);
    counter!(record_stalled_claim, stalled_claims);
    counter!(record_success, succeeded);
    counter!(record_failure, failed);
    counter!(record_retry_handoff, retry_handoffs);
    counter!(record_panic, panics);
    counter!(record_abandoned, abandoned);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            double_acks: self.double_acks.load(Ordering::Relaxed),
            failed_acks: self.failed_acks.load(Ordering::Relaxed),
            stalled_claims: self.stalled_claims.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retry_handoffs: self.retry_handoffs.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::Capacity;
    use crate::job::Priority;

    #[test]
    fn staging_key_appends_suffix() {
        assert_eq!(staging_key("mail"), "mail:inflight");
    }

    #[test]
    fn claim_carries_key_and_token() {
        let capacity = Capacity::new(1);
        let job = Job::claimed("mail", Priority(1), b"x".to_vec());
        let key = LedgerKey::new(staging_key("mail"), b"x".to_vec());
        let mut claim = Claim::new(job, key.clone())
            .with_token(capacity.try_acquire().unwrap());

        assert_eq!(claim.state(), LedgerState::Claimed(key));
        assert!(claim.holds_token());
        assert_eq!(capacity.available(), 0);

        claim.release_token();
        assert_eq!(capacity.available(), 1);
    }

    #[test]
    fn dropping_claim_releases_token() {
        let capacity = Capacity::new(1);
        let job = Job::claimed("q", Priority(1), b"x".to_vec());
        let claim = Claim::new(job, LedgerKey::new(staging_key("q"), b"x".to_vec()))
            .with_token(capacity.try_acquire().unwrap());
        drop(claim);
        assert_eq!(capacity.available(), 1);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = LedgerStats::new();
        stats.record_claim();
        stats.record_claim();
        stats.record_ack();
        stats.record_stalled_claim();

        let snap = stats.snapshot();
        assert_eq!(snap.claimed, 2);
        assert_eq!(snap.acknowledged, 1);
        assert_eq!(snap.stalled_claims, 1);
        assert_eq!(snap.unacknowledged(), 1);
    }
}
