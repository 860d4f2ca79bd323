//! Kernel time: the global tick counter.
//!
//! The hardware timer interrupt advances one global tick count; the
//! scheduler's slices, the sleep queues, and the soft-timer engine all
//! run on these ticks.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks per second the kernel timer is programmed for.
pub const TICK_HZ: u64 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advances the tick count by one. Called from the timer interrupt.
pub fn advance() -> u64 {
    TICKS.fetch_add(1, Ordering::Release) + 1
}

/// The current tick count.
#[must_use]
pub fn now() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Converts milliseconds to ticks.
#[must_use]
pub fn millis_to_ticks(ms: u64) -> u64 {
    ms * TICK_HZ / 1000
}
