//! A single-slot latch that coalesces wake requests.
//!
//! When a worker is about to go idle, it needs to ask the (out-of-scope)
//! thread-count controller for help if more work shows up after it stops
//! looking. Without coalescing, every producer racing to enqueue work would
//! call the controller once each; with this latch, only the first one in
//! any given idle window actually does.

use std::sync::atomic::{AtomicU8, Ordering};

const RELEASED: u8 = 0;
const ARMED: u8 = 1;

/// A 0/1 atomic flag: `arm` transitions released to armed exactly once per
/// cycle, `release` always resets to released.
pub struct ThreadRequestLatch {
    state: AtomicU8,
}

impl ThreadRequestLatch {
    pub const fn new() -> Self {
        ThreadRequestLatch { state: AtomicU8::new(RELEASED) }
    }

    /// Attempts to arm the latch. Returns `true` only for the caller that
    /// performed the released-to-armed transition; every other concurrent
    /// caller (and every caller once it's already armed) gets `false`.
    ///
    /// Callers should only act on a request (e.g. call
    /// `controller.request_worker()`) when this returns `true`.
    pub fn arm(&self) -> bool {
        self.state.compare_exchange(RELEASED, ARMED, Ordering::SeqCst, Ordering::Relaxed).is_ok()
    }

    /// Resets the latch to released, allowing a future `arm` to succeed
    /// again. Idempotent.
    pub fn release(&self) {
        self.state.store(RELEASED, Ordering::SeqCst);
    }

    /// `true` if the latch is currently armed.
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ARMED
    }
}

impl Default for ThreadRequestLatch {
    fn default() -> Self {
        Self::new()
    }
}
