//! HPET driver.
//!
//! The preferred kernel timer when ACPI describes one: a 64-bit main
//! counter in a 1 KiB memory-mapped block, with per-timer comparators.
//! kaon uses comparator 0 in one-shot mode; the soft-timer engine
//! re-arms it from each retirement pass.

use kaon_core::addr::VirtAddr;
use kaon_sched::timer::{HardwareTimer, Timestamp};

/// Capability and ID register.
const REG_CAPABILITIES: u32 = 0x00;
/// General configuration register.
const REG_CONFIG: u32 = 0x10;
/// General interrupt status register.
const REG_INT_STATUS: u32 = 0xF0;
/// Main counter value.
const REG_MAIN_COUNTER: u32 = 0xF8;

/// Configuration: overall enable.
const CONFIG_ENABLE: u64 = 1 << 0;
/// Configuration: legacy replacement routing.
const CONFIG_LEGACY: u64 = 1 << 1;

/// Per-timer register stride.
const TIMER_STRIDE: u32 = 0x20;
/// Per-timer block base.
const TIMER_BASE: u32 = 0x100;

/// Timer configuration: interrupt enable.
const TIMER_INT_ENABLE: u64 = 1 << 2;

/// The HPET block.
pub struct Hpet {
    base: VirtAddr,
    /// Femtoseconds per main-counter tick, from the capability word.
    period_fs: u32,
}

impl Hpet {
    /// Wraps a mapped event-timer block.
    ///
    /// # Safety
    ///
    /// `base` must be a live uncached mapping of the 1 KiB HPET block.
    #[must_use]
    pub unsafe fn new(base: VirtAddr) -> Self {
        let mut hpet = Self { base, period_fs: 0 };
        hpet.period_fs = (hpet.read64(REG_CAPABILITIES) >> 32) as u32;
        hpet
    }

    fn read32(&self, reg: u32) -> u32 {
        // SAFETY: the constructor's contract covers the block.
        unsafe { (self.base + reg).as_ptr::<u32>().read_volatile() }
    }

    fn read64(&self, reg: u32) -> u64 {
        let low = self.read32(reg);
        let high = self.read32(reg + 4);
        (u64::from(high) << 32) | u64::from(low)
    }

    fn write64(&self, reg: u32, value: u64) {
        // SAFETY: see `read64`.
        unsafe {
            #[expect(clippy::cast_possible_truncation, reason = "dword split")]
            (self.base + reg).as_mut_ptr::<u32>().write_volatile(value as u32);
            #[expect(clippy::cast_possible_truncation, reason = "dword split")]
            (self.base + (reg + 4))
                .as_mut_ptr::<u32>()
                .write_volatile((value >> 32) as u32);
        }
    }

    fn timer_reg(timer: u8, offset: u32) -> u32 {
        TIMER_BASE + u32::from(timer) * TIMER_STRIDE + offset
    }

    /// Femtoseconds per counter tick.
    #[must_use]
    pub fn period_fs(&self) -> u32 {
        self.period_fs
    }

    /// Starts the main counter with legacy replacement routing, so
    /// comparator 0 takes the PIT's interrupt line.
    pub fn enable(&self) {
        let config = self.read64(REG_CONFIG);
        self.write64(REG_CONFIG, config | CONFIG_ENABLE | CONFIG_LEGACY);
    }

    /// Stops the main counter.
    pub fn disable(&self) {
        let config = self.read64(REG_CONFIG);
        self.write64(REG_CONFIG, config & !CONFIG_ENABLE);
    }

    /// The main counter value.
    ///
    /// IA-32 reads the 64-bit counter as two dwords; the high half is
    /// sampled on both sides of the low read to reject a carry tearing
    /// the pair.
    #[must_use]
    pub fn counter(&self) -> u64 {
        loop {
            let high = self.read32(REG_MAIN_COUNTER + 4);
            let low = self.read32(REG_MAIN_COUNTER);
            if self.read32(REG_MAIN_COUNTER + 4) == high {
                return (u64::from(high) << 32) | u64::from(low);
            }
        }
    }

    /// Arms comparator 0 to fire at the absolute counter value
    /// `deadline`.
    pub fn arm_comparator(&self, deadline: u64) {
        let config = self.read64(Self::timer_reg(0, 0));
        self.write64(Self::timer_reg(0, 0), config | TIMER_INT_ENABLE);
        self.write64(Self::timer_reg(0, 8), deadline);
    }

    /// Disarms comparator 0.
    pub fn disarm_comparator(&self) {
        let config = self.read64(Self::timer_reg(0, 0));
        self.write64(Self::timer_reg(0, 0), config & !TIMER_INT_ENABLE);
    }

    /// Acknowledges a level-triggered comparator-0 interrupt.
    pub fn ack(&self) {
        self.write64(REG_INT_STATUS, 1);
    }
}

impl HardwareTimer for Hpet {
    fn update_counter(&mut self) -> Timestamp {
        self.counter()
    }

    fn reset_counter(&mut self) {
        self.disable();
        self.write64(REG_MAIN_COUNTER, 0);
        self.enable();
    }

    fn set_counter(&mut self, value: Timestamp) {
        self.disable();
        self.write64(REG_MAIN_COUNTER, value);
        self.enable();
    }

    fn stop_counter(&mut self) {
        self.disarm_comparator();
    }

    fn notify_after(&mut self, delay: u64) {
        let deadline = self.counter() + delay;
        self.arm_comparator(deadline);
    }

    fn fire_at(&mut self, deadline: Timestamp) {
        self.arm_comparator(deadline);
    }
}
