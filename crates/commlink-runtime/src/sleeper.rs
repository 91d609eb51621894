//! Cancellable timed waits.
//!
//! The supervisor's read loop, the reconnect delay, and the idle wait all
//! sleep on one [`Sleeper`] so that a single `cancel` wakes every waiter
//! within one tick. Cancellation is latched: once cancelled, every
//! subsequent sleep returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Default)]
pub struct Sleeper {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the
    /// sleep was cut short (or the sleeper was already cancelled).
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent
        // `cancel` cannot slip between the check and the wait.
        notified.as_mut().enable();
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = &mut notified => false,
        }
    }

    /// Latch cancellation and wake every current waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
