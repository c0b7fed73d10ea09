//! Byte-counting flow-control window.
//!
//! `ByteThrottler` bounds the bytes a source may have in flight to one sink.
//! A pump iteration reserves a nominal chunk budget up front, resizes the
//! reservation to the real chunk size once the store has produced it (the
//! store may overshoot by one item), and transfers the hold into the
//! client's in-flight reservation, which shrinks as the sink acknowledges.
//! Waiters are served strictly first come, first served.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

struct Waiter {
    bytes: u64,
    grant: oneshot::Sender<GrantToken>,
}

struct ThrottlerState {
    /// Bytes currently reserved. May transiently exceed `capacity` after a
    /// resize; new reservations wait until it is back under.
    outstanding: u64,
    queue: VecDeque<Waiter>,
}

struct Inner {
    capacity: u64,
    state: Mutex<ThrottlerState>,
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, ThrottlerState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn release(inner: &Arc<Inner>, bytes: u64) {
    let mut state = lock_state(inner);
    state.outstanding = state.outstanding.saturating_sub(bytes);
    grant_waiters(inner, &mut state);
}

fn grant_waiters(inner: &Arc<Inner>, state: &mut ThrottlerState) {
    while let Some(front) = state.queue.front() {
        if state.outstanding + front.bytes > inner.capacity {
            break;
        }
        let Some(waiter) = state.queue.pop_front() else {
            break;
        };
        state.outstanding += waiter.bytes;
        let token = GrantToken {
            inner: inner.clone(),
            bytes: waiter.bytes,
            armed: true,
        };
        if let Err(mut unsent) = waiter.grant.send(token) {
            // Receiver gave up while queued; give the bytes back without
            // re-entering the lock from the token's drop.
            unsent.armed = false;
            state.outstanding -= unsent.bytes;
        }
    }
}

/// FIFO-fair counting semaphore over bytes. Clones share the window.
#[derive(Clone)]
pub struct ByteThrottler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ByteThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteThrottler")
            .field("capacity", &self.capacity())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl ByteThrottler {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(ThrottlerState {
                    outstanding: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Bytes currently reserved across all holders.
    pub fn outstanding(&self) -> u64 {
        lock_state(&self.inner).outstanding
    }

    /// Reserve `bytes`, waiting FIFO behind earlier reservations. Dropping
    /// the future while queued or just-granted returns the bytes.
    pub async fn reserve(&self, bytes: u64) -> Reservation {
        let waiting = {
            let mut state = lock_state(&self.inner);
            if state.queue.is_empty() && state.outstanding + bytes <= self.inner.capacity {
                state.outstanding += bytes;
                None
            } else {
                let (grant, rx) = oneshot::channel();
                state.queue.push_back(Waiter { bytes, grant });
                Some(rx)
            }
        };
        match waiting {
            None => Reservation {
                inner: self.inner.clone(),
                bytes,
            },
            // The granter has already counted the bytes; an unreceived token
            // releases them from its drop.
            Some(rx) => match rx.await {
                Ok(token) => token.into_reservation(),
                // The window cannot drop while we hold it.
                Err(_) => Reservation {
                    inner: self.inner.clone(),
                    bytes,
                },
            },
        }
    }

    /// A zero-byte hold that bytes can be transferred into later.
    pub fn hold(&self) -> Reservation {
        Reservation {
            inner: self.inner.clone(),
            bytes: 0,
        }
    }
}

/// Granted bytes in transit between the throttler queue and a reservation.
/// Dropping it unreceived returns the bytes to the window.
struct GrantToken {
    inner: Arc<Inner>,
    bytes: u64,
    armed: bool,
}

impl GrantToken {
    fn into_reservation(mut self) -> Reservation {
        self.armed = false;
        Reservation {
            inner: self.inner.clone(),
            bytes: self.bytes,
        }
    }
}

impl Drop for GrantToken {
    fn drop(&mut self) {
        if self.armed {
            release(&self.inner, self.bytes);
        }
    }
}

/// RAII hold on throttler bytes; releases on drop.
pub struct Reservation {
    inner: Arc<Inner>,
    bytes: u64,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").field("bytes", &self.bytes).finish()
    }
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Adjust the hold to `bytes`. Growing never waits; the window absorbs
    /// the overshoot and later reservations queue until it drains.
    pub fn resize(&mut self, bytes: u64) {
        if bytes > self.bytes {
            let mut state = lock_state(&self.inner);
            state.outstanding += bytes - self.bytes;
        } else if bytes < self.bytes {
            release(&self.inner, self.bytes - bytes);
        }
        self.bytes = bytes;
    }

    /// Give back `bytes` of the hold.
    pub fn shrink(&mut self, bytes: u64) {
        debug_assert!(bytes <= self.bytes);
        self.resize(self.bytes.saturating_sub(bytes));
    }

    /// Move this hold into `other` without touching the window.
    pub fn transfer_into(mut self, other: &mut Reservation) {
        debug_assert!(Arc::ptr_eq(&self.inner, &other.inner));
        other.bytes += self.bytes;
        self.bytes = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            release(&self.inner, self.bytes);
        }
    }
}
