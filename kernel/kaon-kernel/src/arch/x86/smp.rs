//! Application-processor bring-up.
//!
//! Each AP is started with the INIT-SIPI-SIPI sequence: the trampoline
//! (a tiny real-mode stub assembled into the kernel image) is copied to
//! a fixed page below 1 MiB, the AP is kicked, and the BSP spins until
//! the AP increments the ready counter from its Rust entry point.

use core::sync::atomic::{AtomicU32, Ordering};

use kaon_core::{kinfo, kwarn};

use super::apic::LocalApic;

/// Physical address of the trampoline page (below 1 MiB, free of BIOS
/// data structures).
pub const TRAMPOLINE_PHYS: u32 = 0x7000;

/// SIPI start-page number: the AP begins at `page << 12` in real mode.
pub const TRAMPOLINE_PAGE: u8 = (TRAMPOLINE_PHYS >> 12) as u8;

/// How many spin iterations to wait for an AP before giving up.
const AP_WAIT_SPINS: u32 = 50_000_000;

unsafe extern "C" {
    /// Start of the real-mode trampoline blob (linker symbols).
    static __trampoline_start: u8;
    /// End of the trampoline blob.
    static __trampoline_end: u8;
}

/// CPUs that reached their Rust entry point.
static CPUS_READY: AtomicU32 = AtomicU32::new(0);

/// Called by each AP from its entry stub once it is on its own stack.
pub fn signal_ready() {
    CPUS_READY.fetch_add(1, Ordering::Release);
}

/// Copies the trampoline to its low-memory page.
///
/// # Safety
///
/// The trampoline page must be identity-mapped and reserved in the
/// frame layout; no other user of that page may exist.
pub unsafe fn install_trampoline() {
    // SAFETY: the linker guarantees the blob bounds; the destination
    // page is reserved by the caller's contract.
    unsafe {
        let start = core::ptr::addr_of!(__trampoline_start);
        let end = core::ptr::addr_of!(__trampoline_end);
        let len = end.offset_from(start).unsigned_abs();
        debug_assert!(len <= 4096, "trampoline must fit one page");
        core::ptr::copy_nonoverlapping(start, TRAMPOLINE_PHYS as *mut u8, len);
    }
}

/// Starts one AP and waits for it to signal readiness.
///
/// Returns `true` when the AP came up.
pub fn start_ap(apic: &LocalApic, apic_id: u8) -> bool {
    let ready_before = CPUS_READY.load(Ordering::Acquire);

    // INIT, settle, then two SIPIs per the MP start-up protocol.
    apic.send_init(apic_id);
    spin_delay(1_000_000);
    apic.send_sipi(apic_id, TRAMPOLINE_PAGE);
    spin_delay(200_000);
    apic.send_sipi(apic_id, TRAMPOLINE_PAGE);

    let mut waited = 0u32;
    while CPUS_READY.load(Ordering::Acquire) == ready_before {
        core::hint::spin_loop();
        waited += 1;
        if waited > AP_WAIT_SPINS {
            kwarn!("apic {apic_id}: AP did not signal ready");
            return false;
        }
    }
    kinfo!("apic {apic_id}: AP online");
    true
}

/// Number of CPUs online (BSP excluded until it signals too).
#[must_use]
pub fn cpus_ready() -> u32 {
    CPUS_READY.load(Ordering::Acquire)
}

fn spin_delay(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}
