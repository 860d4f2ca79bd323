//! IA-32 hardware support: port I/O, descriptor tables, the interrupt
//! controllers, the kernel timers, and application-processor bring-up.

pub mod apic;
pub mod cpuid;
pub mod gdt;
pub mod hpet;
pub mod idt;
pub mod io;
pub mod ioapic;
pub mod pit;
pub mod serial;
pub mod smp;
pub mod tss;
