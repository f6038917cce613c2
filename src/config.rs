use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ProcessorError, Result};
use crate::job::Priority;

/// Exponential backoff used for broker reconnects and acknowledgement retries.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for a single delay
    pub max: Duration,
    /// Multiplier applied after each failed attempt
    pub factor: u32,
    /// Maximum attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn bounded(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            factor: 2,
            max_attempts: Some(max_attempts),
        }
    }

    /// Delay to wait before retry number `attempt` (zero-based), with up to
    /// 10% random jitter so fetchers do not reconnect in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let factor = self.factor.max(1).saturating_pow(attempt.min(16));
        let base = self.initial.saturating_mul(factor).min(self.max);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// One broker queue served by a dedicated fetcher.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Priority weight given to every job claimed from this queue
    pub priority: Priority,
    /// How long a single claim may block on an empty queue
    pub claim_timeout: Duration,
    /// Shorter claim timeout used while no spare capacity token is left
    pub contended_claim_timeout: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority: Priority(priority),
            claim_timeout: Duration::from_secs(2),
            contended_claim_timeout: Duration::from_millis(10),
        }
    }

    /// Parse a `name` or `name:priority` queue spec. A missing priority
    /// defaults to 1.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (name, priority) = match spec.rsplit_once(':') {
            Some((name, priority)) => {
                let priority = priority.parse::<u32>().map_err(|_| {
                    fatal(&format!("queue {spec:?} has an invalid priority, expected name:priority"))
                })?;
                (name, priority)
            }
            None => (spec, 1),
        };
        if name.is_empty() {
            return Err(fatal(&format!("queue {spec:?} has no name")));
        }
        Ok(Self::new(name, priority))
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_contended_claim_timeout(mut self, timeout: Duration) -> Self {
        self.contended_claim_timeout = timeout;
        self
    }

    /// Timeout for the next claim, given whether capacity tokens are scarce.
    pub fn claim_timeout_for(&self, contended: bool) -> Duration {
        if contended {
            self.claim_timeout.min(self.contended_claim_timeout)
        } else {
            self.claim_timeout
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queues: Vec<QueueConfig>,
    /// Number of worker slots, and therefore of capacity tokens
    pub concurrency: usize,
    /// A task holding the scheduler longer than this is asked to yield
    pub preemption_threshold: Duration,
    /// How often the watchdog thread checks the switch timestamp
    pub watchdog_interval: Duration,
    /// How long running jobs get to finish once shutdown starts
    pub shutdown_grace: Duration,
    /// Period of the housekeeping stats task
    pub stats_interval: Duration,
    /// Reconnect policy for fetchers (unbounded)
    pub fetch_backoff: BackoffConfig,
    /// Retry policy for acknowledgements (bounded)
    pub ack_retry: BackoffConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            concurrency: 10,
            preemption_threshold: Duration::from_millis(100),
            watchdog_interval: Duration::from_millis(25),
            shutdown_grace: Duration::from_secs(25),
            stats_interval: Duration::from_secs(5),
            fetch_backoff: BackoffConfig::default(),
            ack_retry: BackoffConfig::bounded(
                Duration::from_millis(50),
                Duration::from_secs(2),
                5,
            ),
        }
    }
}

impl ProcessorConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_preemption_threshold(mut self, threshold: Duration) -> Self {
        self.preemption_threshold = threshold;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reject configurations the processor cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(fatal("no queues configured"));
        }
        if self.concurrency == 0 {
            return Err(fatal("concurrency must be at least 1"));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(fatal("queue name must not be empty"));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(fatal(&format!("queue {} configured twice", queue.name)));
            }
            if queue.claim_timeout.is_zero() || queue.contended_claim_timeout.is_zero() {
                return Err(fatal(&format!("queue {} has a zero claim timeout", queue.name)));
            }
        }
        if self.preemption_threshold.is_zero() || self.watchdog_interval.is_zero() {
            return Err(fatal("preemption threshold and watchdog interval must be non-zero"));
        }
        if self.watchdog_interval > self.preemption_threshold {
            return Err(fatal(&format!(
                "watchdog interval {:?} exceeds preemption threshold {:?}",
                self.watchdog_interval, self.preemption_threshold
            )));
        }
        Ok(())
    }
}

fn fatal(msg: &str) -> ProcessorError {
    ProcessorError::FatalConfiguration(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProcessorConfig {
        ProcessorConfig::new(4).with_queue(QueueConfig::new("default", 1))
    }

    #[test]
    fn processor_config_default() {
        let cfg = ProcessorConfig::default();
        assert!(cfg.queues.is_empty());
        assert_eq!(cfg.concurrency, 10);
        assert_eq!(cfg.preemption_threshold, Duration::from_millis(100));
        assert!(cfg.fetch_backoff.max_attempts.is_none());
        assert_eq!(cfg.ack_retry.max_attempts, Some(5));
    }

    #[test]
    fn queue_config_builder() {
        let q = QueueConfig::new("mail", 5).with_claim_timeout(Duration::from_millis(250));
        assert_eq!(q.name, "mail");
        assert_eq!(q.priority, Priority(5));
        assert_eq!(q.claim_timeout, Duration::from_millis(250));
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_no_queues() {
        let err = ProcessorConfig::new(4).validate().unwrap_err();
        assert!(matches!(err, ProcessorError::FatalConfiguration(_)));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut cfg = valid();
        cfg.concurrency = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ProcessorError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn validate_rejects_duplicate_queue() {
        let cfg = valid().with_queue(QueueConfig::new("default", 3));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn validate_rejects_zero_claim_timeout() {
        let cfg = ProcessorConfig::new(1)
            .with_queue(QueueConfig::new("q", 1).with_claim_timeout(Duration::ZERO));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_watchdog_slower_than_threshold() {
        let mut cfg = valid();
        cfg.preemption_threshold = Duration::from_millis(20);
        cfg.watchdog_interval = Duration::from_millis(50);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ProcessorError::FatalConfiguration(_)));
        assert!(err.to_string().contains("exceeds preemption threshold"));

        cfg.watchdog_interval = Duration::from_millis(20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn queue_spec_parsing() {
        let q = QueueConfig::parse("critical:10").unwrap();
        assert_eq!(q.name, "critical");
        assert_eq!(q.priority, Priority(10));
        assert_eq!(QueueConfig::parse(" plain ").unwrap().priority, Priority(1));
    }

    #[test]
    fn malformed_queue_spec_is_fatal() {
        for spec in ["mail:x", "mail:-1", ":5"] {
            assert!(
                matches!(
                    QueueConfig::parse(spec),
                    Err(ProcessorError::FatalConfiguration(_))
                ),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn contended_claims_use_shorter_timeout() {
        let q = QueueConfig::new("q", 1)
            .with_claim_timeout(Duration::from_secs(2))
            .with_contended_claim_timeout(Duration::from_millis(10));
        assert_eq!(q.claim_timeout_for(false), Duration::from_secs(2));
        assert_eq!(q.claim_timeout_for(true), Duration::from_millis(10));

        let short = q.with_claim_timeout(Duration::from_millis(5));
        assert_eq!(short.claim_timeout_for(true), Duration::from_millis(5));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            factor: 2,
            max_attempts: None,
        };
        let first = backoff.delay_for(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let third = backoff.delay_for(2);
        assert!(third >= Duration::from_millis(350) - Duration::from_millis(1));
        assert!(backoff.delay_for(30) <= Duration::from_millis(350));
    }

    #[test]
    fn bounded_backoff_exhausts() {
        let backoff = BackoffConfig::bounded(Duration::from_millis(1), Duration::from_millis(5), 3);
        assert!(!backoff.exhausted(2));
        assert!(backoff.exhausted(3));
        assert!(!BackoffConfig::default().exhausted(u32::MAX));
    }
}
