//! One-shot drain signal for cooperative teardown.
//!
//! A `Drain` is pulsed exactly once. Tasks park on `pulsed()` inside a
//! `tokio::select!` at every cancellable wait; pulsing wakes all of them,
//! including waiters that register afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Drain {
    fired: AtomicBool,
    notify: Notify,
}

impl Drain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn pulse(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_pulsed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolve once the signal has fired.
    pub async fn pulsed(&self) {
        loop {
            if self.is_pulsed() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a pulse between the check and
            // the registration is not lost.
            if self.is_pulsed() {
                return;
            }
            notified.await;
        }
    }
}
