//! Write-token lane preserving per-direction message order.
//!
//! Mailbox endpoints are independent, so a peer that sends on several of
//! them needs an ordering discipline that spans all of them. Each sent
//! message carries a `WriteToken` drawn from the sender's `FifoSource`;
//! the receiving side admits handlers through a `FifoSink` strictly in
//! token order, one at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Opaque, monotonically ordered token naming one message's turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriteToken(u64);

/// Issues write tokens in send order.
#[derive(Debug, Default)]
pub struct FifoSource {
    next: AtomicU64,
}

impl FifoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_write(&self) -> WriteToken {
        WriteToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Admits one token holder at a time, strictly in token order.
#[derive(Debug, Default)]
pub struct FifoSink {
    admitted: Mutex<u64>,
    notify: Notify,
}

impl FifoSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `token`'s turn. The returned slot holds the lane until it
    /// is dropped, admitting the successor.
    pub async fn exit_write(&self, token: WriteToken) -> FifoSlot<'_> {
        loop {
            {
                let admitted = self.admitted_lock();
                if *admitted == token.0 {
                    return FifoSlot { sink: self, token };
                }
                debug_assert!(*admitted < token.0, "write token reused");
            }
            let notified = self.notify.notified();
            // Re-check after registering so an admission between the check
            // and the registration is not lost.
            if *self.admitted_lock() == token.0 {
                return FifoSlot { sink: self, token };
            }
            notified.await;
        }
    }

    fn admitted_lock(&self) -> std::sync::MutexGuard<'_, u64> {
        match self.admitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Exclusive hold on the lane for one token.
#[derive(Debug)]
pub struct FifoSlot<'a> {
    sink: &'a FifoSink,
    token: WriteToken,
}

impl Drop for FifoSlot<'_> {
    fn drop(&mut self) {
        *self.sink.admitted_lock() = self.token.0 + 1;
        self.sink.notify.notify_waiters();
    }
}
