//! Guard-less spin lock for lock-coupled tree walks.
//!
//! The topology registry descends the domain tree holding the parent's lock
//! until the child's lock is taken. RAII guards cannot express that shape
//! (the two lifetimes interleave), so this lock exposes explicit
//! [`RawSpinLock::acquire`] / [`RawSpinLock::release`] pairs.

use core::sync::atomic::{AtomicBool, Ordering};

/// A TTAS spin lock with explicit acquire/release and no guarded data.
///
/// The protected state lives next to the lock in the owning structure;
/// callers are responsible for pairing every `acquire` with a `release`.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Creates a new unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    pub fn acquire(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock; returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Must only be called by the holder; releasing an un-held lock corrupts
    /// the critical-section discipline of the caller.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Returns `true` if the lock is currently held by someone.
    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycle() {
        let lock = RawSpinLock::new();
        lock.acquire();
        assert!(lock.is_held());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
        lock.release();
    }
}
