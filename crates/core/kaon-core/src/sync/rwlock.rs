//! Spin-based reader-writer lock.
//!
//! Many concurrent readers or one writer. Writers are preferred: once a
//! writer announces intent, new readers spin until it has come and gone, so
//! a steady stream of lookups cannot starve a table resize.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// Bit set while a writer holds (or is waiting for) the lock.
const WRITER: u32 = 1 << 31;

/// A spin-based reader-writer lock.
pub struct RwLock<T> {
    /// Low 31 bits: active reader count. High bit: writer present.
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: Access to `T` is mediated by the reader/writer state machine.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwLockReadGuard { lock: self };
            }
            core::hint::spin_loop();
        }
    }

    /// Acquires the lock for exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        // Announce writer intent so readers back off.
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(s, s | WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        // Wait for in-flight readers to drain.
        while self.state.load(Ordering::Acquire) != WRITER {
            core::hint::spin_loop();
        }

        RwLockWriteGuard { lock: self }
    }

    /// Returns a mutable reference without locking.
    ///
    /// Statically exclusive through `&mut self`, so no synchronisation is
    /// needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Shared-access RAII guard for [`RwLock`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Readers hold a share of the lock; no writer can be active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive-access RAII guard for [`RwLock`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The writer bit grants exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The writer bit grants exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers() {
        let lock = RwLock::new(7);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 7);
        assert_eq!(*r2, 7);
    }

    #[test]
    fn write_then_read() {
        let lock = RwLock::new(0);
        {
            let mut w = lock.write();
            *w = 13;
        }
        assert_eq!(*lock.read(), 13);
    }

    #[test]
    fn get_mut_bypasses_lock() {
        let mut lock = RwLock::new(1);
        *lock.get_mut() = 2;
        assert_eq!(*lock.read(), 2);
    }
}
