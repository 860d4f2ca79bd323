//! Spin-based synchronisation primitives.
//!
//! The kernel never blocks inside these locks; every critical section is
//! short and bounded. [`IrqSpinLock`] additionally disables interrupts so
//! data shared with interrupt handlers cannot deadlock against the
//! interrupted context.

mod irq_spinlock;
mod lazy;
mod raw;
mod rwlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use lazy::{LazyLock, Once};
pub use raw::RawSpinLock;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
