//! Futex-style wait/notify on a 32-bit atomic.
//!
//! Native targets park through the `atomic-wait` crate (futex-backed where
//! available). Simulated interrupt lines use these to block a dispatcher the
//! same way a UIO read would.

use std::sync::atomic::{AtomicU32, Ordering};

/// Result of parking on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller slept and returned after a wake or spuriously.
    Woken,
    /// The value had already moved away from `expected`.
    NotEqual,
}

/// Blocks while `atomic` still holds `expected`.
///
/// May return spuriously; callers re-check their condition in a loop.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    if atomic.load(Ordering::Acquire) != expected {
        return WaitResult::NotEqual;
    }
    atomic_wait::wait(atomic, expected);
    WaitResult::Woken
}

/// Wakes every waiter parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    atomic_wait::wake_all(atomic as *const AtomicU32);
}

/// Bumps `atomic` and wakes all of its waiters. Returns the new value.
#[inline]
pub fn bump_and_wake(atomic: &AtomicU32) -> u32 {
    let next = atomic.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    wake_all(atomic);
    next
}
