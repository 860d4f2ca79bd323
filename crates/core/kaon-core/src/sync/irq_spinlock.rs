//! Interrupt-safe spin lock.
//!
//! Disables interrupts before acquiring the inner spinlock and restores the
//! previous interrupt state on release. Data shared between interrupt
//! handlers and normal kernel code must be guarded by this lock, never by a
//! plain [`super::SpinLock`].

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin lock that disables local interrupts while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Same reasoning as SpinLock — atomic ops ensure exclusive access.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        // Save current EFLAGS and disable interrupts.
        let saved_flags = save_flags_and_cli();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    saved_flags,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                saved_flags,
            })
        } else {
            // Failed — restore flags.
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard that restores the interrupt state on drop.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u32,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_flags);
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn save_flags_and_cli() -> u32 {
    let flags: u32;
    // SAFETY: Reading EFLAGS and disabling interrupts is safe in ring 0.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn restore_flags(flags: u32) {
    // Only the IF bit is restored; everything else keeps its current value.
    const IF: u32 = 1 << 9;
    if flags & IF != 0 {
        // SAFETY: Re-enabling interrupts is safe; the caller held them
        // disabled only for the critical section.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
}

/// Host fallback: interrupt state does not exist, flags are a no-op.
#[cfg(not(all(target_os = "none", target_arch = "x86")))]
#[inline]
fn save_flags_and_cli() -> u32 {
    0
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
#[inline]
fn restore_flags(_flags: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_data() {
        let lock = IrqSpinLock::new(5);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = IrqSpinLock::new(());
        let _g = lock.lock();
        assert!(lock.try_lock().is_none());
    }
}
