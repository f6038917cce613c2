//! Cooperative scheduling support.
//!
//! Everything in the processor runs as tokio tasks on a single-threaded
//! runtime, so a task only gives up the thread at an `.await` that actually
//! waits. A job handler crunching numbers without awaiting would starve the
//! fetchers and the housekeeping task. This module adds the missing piece:
//!
//! - [`Scheduler`]: a handle passed to every long-running task. Tasks are
//!   wrapped with [`Scheduler::track`], which records every poll entry and
//!   every park, keeping a "last switch" timestamp fresh.
//! - [`Watchdog`]: an OS thread that checks the timestamp on a fixed interval
//!   and, once it is older than the preemption threshold, raises a preemption
//!   request on the handle.
//! - [`Scheduler::checkpoint`]: called from long-running code; when a request
//!   is pending it yields to the back of the runtime's ready queue.
//!
//! # Limitation
//!
//! Code that never reaches a checkpoint cannot be interrupted. The watchdog
//! logs a warning for every threshold period a request stays unhonoured.

pub mod watchdog;

pub use watchdog::Watchdog;

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

thread_local! {
    // Number of tracked polls on the stack of this thread.
    static TRACKED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Watchdog view of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// No registered task is holding the thread.
    Idle,
    /// A registered task is running; `since` is the last context switch.
    Monitoring { since: Instant },
}

/// Shared handle to the cooperative scheduler state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    epoch: Instant,
    threshold: Duration,
    last_switch_nanos: AtomicU64,
    running: AtomicUsize,
    preempt: AtomicBool,
    requested_at_nanos: AtomicU64,
    forced: AtomicU64,
    honoured: AtomicU64,
    unhonoured: AtomicU64,
}

/// Marks a task as registered with the scheduler for as long as it lives.
#[must_use = "the task is unregistered as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TaskGuard {
    scheduler: Scheduler,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.scheduler.inner.running.fetch_sub(1, Ordering::AcqRel);
        self.scheduler.register_yield();
    }
}

/// Re-registers a task as running when its wait ends, even if the wait was
/// cancelled by a `select!`. Only undoes a park that actually happened.
struct Resume<'a> {
    scheduler: &'a Scheduler,
    parked: bool,
}

impl Drop for Resume<'_> {
    fn drop(&mut self) {
        if self.parked {
            self.scheduler.inner.running.fetch_add(1, Ordering::AcqRel);
        }
        self.scheduler.register_yield();
    }
}

/// Future wrapper that counts its task as running only while it is being
/// polled. Created by [`Scheduler::track`].
#[must_use = "futures do nothing unless polled"]
pub struct Tracked<F> {
    scheduler: Scheduler,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = &mut *self;
        let _polling = Polling::start(&this.scheduler);
        this.inner.as_mut().poll(cx)
    }
}

/// One poll of a tracked task. Parks the task again on drop, whether the poll
/// returned `Pending`, `Ready` or unwound.
struct Polling<'a> {
    scheduler: &'a Scheduler,
}

impl<'a> Polling<'a> {
    fn start(scheduler: &'a Scheduler) -> Self {
        scheduler.inner.running.fetch_add(1, Ordering::AcqRel);
        scheduler.register_yield();
        TRACKED_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { scheduler }
    }
}

impl Drop for Polling<'_> {
    fn drop(&mut self) {
        TRACKED_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        self.scheduler.inner.running.fetch_sub(1, Ordering::AcqRel);
        self.scheduler.register_yield();
    }
}

fn inside_tracked_poll() -> bool {
    TRACKED_DEPTH.with(|depth| depth.get() > 0)
}

impl Scheduler {
    pub fn new(threshold: Duration) -> Self {
        Self {
            inner: Arc::new(Shared {
                epoch: Instant::now(),
                threshold,
                last_switch_nanos: AtomicU64::new(0),
                running: AtomicUsize::new(0),
                preempt: AtomicBool::new(false),
                requested_at_nanos: AtomicU64::new(0),
                forced: AtomicU64::new(0),
                honoured: AtomicU64::new(0),
                unhonoured: AtomicU64::new(0),
            }),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.inner.threshold
    }

    /// Wrap a task so every poll counts as running and every `Pending` as a
    /// context switch. Plain `.await`s inside it need no extra bookkeeping.
    pub fn track<F: Future>(&self, fut: F) -> Tracked<F> {
        Tracked {
            scheduler: self.clone(),
            inner: Box::pin(fut),
        }
    }

    /// Register the calling task as running until the guard is dropped.
    ///
    /// For code that is not wrapped with [`track`](Self::track). Awaits made
    /// while holding the guard should go through [`suspend`](Self::suspend).
    pub fn enter(&self) -> TaskGuard {
        self.inner.running.fetch_add(1, Ordering::AcqRel);
        self.register_yield();
        TaskGuard {
            scheduler: self.clone(),
        }
    }

    /// Record that control just changed hands.
    pub fn register_yield(&self) {
        self.inner
            .last_switch_nanos
            .store(self.now_nanos(), Ordering::Release);
    }

    pub fn since_last_yield(&self) -> Duration {
        let last = self.inner.last_switch_nanos.load(Ordering::Acquire);
        Duration::from_nanos(self.now_nanos().saturating_sub(last))
    }

    pub fn state(&self) -> WatchdogState {
        if self.inner.running.load(Ordering::Acquire) == 0 {
            return WatchdogState::Idle;
        }
        let last = self.inner.last_switch_nanos.load(Ordering::Acquire);
        WatchdogState::Monitoring {
            since: self.inner.epoch + Duration::from_nanos(last),
        }
    }

    /// Ask the running task to yield at its next checkpoint. Returns `false`
    /// if a request was already pending.
    pub fn force_preempt(&self) -> bool {
        if self.inner.preempt.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner
            .requested_at_nanos
            .store(self.now_nanos(), Ordering::Release);
        self.inner.forced.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn preempt_requested(&self) -> bool {
        self.inner.preempt.load(Ordering::Acquire)
    }

    /// Yield to other tasks if the watchdog asked for it. Cheap enough to call
    /// in a hot loop.
    pub async fn checkpoint(&self) {
        if !self.inner.preempt.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.honoured.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(held_for = ?self.since_last_yield(), "Preempting running task");
        self.register_yield();
        tokio::task::yield_now().await;
        self.register_yield();
    }

    /// Await `fut` as a blocking point: the task counts as parked while it
    /// waits and as running again afterwards.
    ///
    /// Inside a tracked task this is a plain await. Called from a task that
    /// never registered, it leaves the running count alone.
    pub async fn suspend<F: Future>(&self, fut: F) -> F::Output {
        if inside_tracked_poll() {
            let output = fut.await;
            self.register_yield();
            return output;
        }

        let parked = self
            .inner
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        self.register_yield();
        let _resume = Resume {
            scheduler: self,
            parked,
        };
        fut.await
    }

    /// Preemption requests raised so far.
    pub fn forced_preemptions(&self) -> u64 {
        self.inner.forced.load(Ordering::Relaxed)
    }

    /// Requests a task actually yielded for.
    pub fn honoured_preemptions(&self) -> u64 {
        self.inner.honoured.load(Ordering::Relaxed)
    }

    /// Threshold periods a request went unanswered.
    pub fn unhonoured_preemptions(&self) -> u64 {
        self.inner.unhonoured.load(Ordering::Relaxed)
    }

    /// One watchdog inspection. Raises a request once the running task has
    /// held the thread past the threshold; warns while a request is ignored.
    pub(crate) fn inspect(&self) {
        if self.state() == WatchdogState::Idle {
            self.clear_stale_request();
            return;
        }
        let held = self.since_last_yield();
        if held < self.inner.threshold {
            self.clear_stale_request();
            return;
        }
        if self.force_preempt() {
            tracing::debug!(held_for = ?held, "Scheduler held past threshold, requesting preemption");
            return;
        }

        let requested = self.inner.requested_at_nanos.load(Ordering::Acquire);
        let pending = Duration::from_nanos(self.now_nanos().saturating_sub(requested));
        if pending >= self.inner.threshold {
            self.inner.unhonoured.fetch_add(1, Ordering::Relaxed);
            self.inner
                .requested_at_nanos
                .store(self.now_nanos(), Ordering::Release);
            tracing::warn!(
                held_for = ?held,
                "Running task has not reached a checkpoint, housekeeping is starved"
            );
        }
    }

    /// A switch happened since the request was raised, so nobody needs to
    /// yield for it any more.
    fn clear_stale_request(&self) {
        if self.inner.preempt.swap(false, Ordering::AcqRel) {
            tracing::trace!("Preemption request satisfied by a natural switch");
        }
    }

    fn now_nanos(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_until_a_task_enters() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        assert_eq!(scheduler.state(), WatchdogState::Idle);

        let guard = scheduler.enter();
        assert!(matches!(scheduler.state(), WatchdogState::Monitoring { .. }));

        drop(guard);
        assert_eq!(scheduler.state(), WatchdogState::Idle);
    }

    #[test]
    fn register_yield_rearms_timestamp() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let _guard = scheduler.enter();
        std::thread::sleep(Duration::from_millis(15));
        assert!(scheduler.since_last_yield() >= Duration::from_millis(15));

        scheduler.register_yield();
        assert!(scheduler.since_last_yield() < Duration::from_millis(15));
    }

    #[test]
    fn inspect_requests_preemption_once_past_threshold() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let _guard = scheduler.enter();

        scheduler.inspect();
        assert!(!scheduler.preempt_requested());

        std::thread::sleep(Duration::from_millis(10));
        scheduler.inspect();
        assert!(scheduler.preempt_requested());
        assert_eq!(scheduler.forced_preemptions(), 1);

        // A pending request is not raised twice
        scheduler.inspect();
        assert_eq!(scheduler.forced_preemptions(), 1);
    }

    #[test]
    fn inspect_ignores_idle_scheduler() {
        let scheduler = Scheduler::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        scheduler.inspect();
        assert!(!scheduler.preempt_requested());
    }

    #[test]
    fn ignored_request_is_counted() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let _guard = scheduler.enter();
        std::thread::sleep(Duration::from_millis(10));
        scheduler.inspect();
        std::thread::sleep(Duration::from_millis(10));
        scheduler.inspect();
        assert_eq!(scheduler.unhonoured_preemptions(), 1);
    }

    #[tokio::test]
    async fn checkpoint_clears_request() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let _guard = scheduler.enter();

        scheduler.checkpoint().await;
        assert_eq!(scheduler.honoured_preemptions(), 0);

        assert!(scheduler.force_preempt());
        scheduler.checkpoint().await;
        assert!(!scheduler.preempt_requested());
        assert_eq!(scheduler.honoured_preemptions(), 1);
    }

    #[tokio::test]
    async fn tracked_task_is_idle_while_parked() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(scheduler.track(async move {
            let _ = rx.await;
        }));
        tokio::task::yield_now().await;
        assert_eq!(scheduler.state(), WatchdogState::Idle);

        let _ = tx.send(());
        task.await.unwrap();
        assert_eq!(scheduler.state(), WatchdogState::Idle);
    }

    #[tokio::test]
    async fn tracked_task_runs_as_monitoring() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let observed = scheduler
            .track({
                let scheduler = scheduler.clone();
                async move { scheduler.state() }
            })
            .await;
        assert!(matches!(observed, WatchdogState::Monitoring { .. }));
        assert_eq!(scheduler.state(), WatchdogState::Idle);
    }

    #[tokio::test]
    async fn suspend_without_registration_stays_idle() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let during = scheduler
            .suspend({
                let scheduler = scheduler.clone();
                async move { scheduler.state() }
            })
            .await;
        assert_eq!(during, WatchdogState::Idle);
        assert_eq!(scheduler.state(), WatchdogState::Idle);

        // Registration afterwards still balances out
        drop(scheduler.enter());
        assert_eq!(scheduler.state(), WatchdogState::Idle);
    }

    #[test]
    fn natural_switch_clears_pending_request() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let guard = scheduler.enter();
        std::thread::sleep(Duration::from_millis(10));
        scheduler.inspect();
        assert!(scheduler.preempt_requested());

        drop(guard);
        scheduler.inspect();
        assert!(!scheduler.preempt_requested());
        assert_eq!(scheduler.unhonoured_preemptions(), 0);
    }

    #[tokio::test]
    async fn suspend_parks_task_while_waiting() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let _guard = scheduler.enter();

        let observed = scheduler
            .suspend({
                let scheduler = scheduler.clone();
                async move { scheduler.state() }
            })
            .await;
        assert_eq!(observed, WatchdogState::Idle);
        assert!(matches!(scheduler.state(), WatchdogState::Monitoring { .. }));
    }
}
