use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::scheduler::Scheduler;

/// Timer thread that inspects the scheduler on a fixed interval.
///
/// Runs outside the tokio runtime so it keeps ticking while a task holds the
/// runtime thread. Stopped and joined on drop.
#[derive(Debug)]
pub struct Watchdog {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(scheduler: Scheduler, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("preempt-watchdog".to_string())
            .spawn(move || {
                tracing::debug!(
                    interval = ?interval,
                    threshold = ?scheduler.threshold(),
                    "Preemption watchdog started"
                );
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock().unwrap_or_else(|p| p.into_inner());
                loop {
                    let (guard, _) = cvar
                        .wait_timeout(stopped, interval)
                        .unwrap_or_else(|p| p.into_inner());
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    scheduler.inspect();
                }
                tracing::debug!("Preemption watchdog stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the timer thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Preemption watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
