//! One-shot initialisation primitives for `no_std`.
//!
//! The bring-up sequencer creates a handful of process-wide singletons
//! (system topology root, kernel memory context, frame manager, module
//! registry, symbol table) exactly once, before any secondary CPU runs.
//! [`Once`] holds such a value; [`LazyLock`] derives it on first access.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A cell that is written exactly once during bring-up and read-only after.
pub struct Once<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The atomic state machine publishes the value with Release/Acquire
// ordering before any reader can observe READY.
unsafe impl<T: Send + Sync> Send for Once<T> {}
unsafe impl<T: Send + Sync> Sync for Once<T> {}

impl<T> Once<T> {
    /// Creates an empty cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores `value`, panicking if the cell was already set.
    ///
    /// The single-writer expectation is structural: only the bring-up
    /// sequencer calls this, once, on the bootstrap CPU.
    pub fn set(&self, value: T) {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("Once::set: cell already initialized");
        }
        // SAFETY: We hold the INITIALIZING state, so nobody else touches
        // the slot.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
    }

    /// Returns the value, or `None` if it has not been set yet.
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY implies the value was fully written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns the value, panicking if it has not been set.
    pub fn expect(&self, msg: &str) -> &T {
        self.get().expect(msg)
    }

    /// Returns `true` once the value has been published.
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl<T> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A value initialised on first access by a stored closure.
///
/// If multiple CPUs race, one runs the initializer and the others spin until
/// the value is ready.
pub struct LazyLock<T, F = fn() -> T> {
    once: Once<T>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The `Once` state machine guarantees the init closure is consumed
// exactly once, by the winning CPU.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            once: Once::new(),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        match self.once.state.compare_exchange(
            UNINIT,
            INITIALIZING,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                // We won the race — run the initializer.
                // SAFETY: Only the winner reaches this branch.
                let init = unsafe { (*self.init.get()).take().unwrap() };
                let value = init();
                // SAFETY: We hold INITIALIZING.
                unsafe { (*self.once.value.get()).write(value) };
                self.once.state.store(READY, Ordering::Release);
            }
            Err(_) => {
                // Someone else is (or was) initializing — wait for READY.
                while self.once.state.load(Ordering::Acquire) != READY {
                    core::hint::spin_loop();
                }
            }
        }
        // SAFETY: READY implies the value was fully written.
        unsafe { (*self.once.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        self.force()
    }
}
