//! ACPI table discovery and parsing.
//!
//! The kernel reaches the ACPI hierarchy through the RSDP left in memory by
//! firmware (and surfaced by the boot loader): RSDP → RSDT/XSDT → per-table
//! SDTs. This crate parses the tables the kernel consumes — MADT (CPU and
//! IO-APIC enumeration), FADT (power-management register block), and the
//! HPET description table.
//!
//! Physical memory access is abstracted behind [`AcpiHandler`] so the same
//! parsing code runs in the kernel (identity/window mappings) and in host
//! unit tests (plain slices).

#![cfg_attr(not(test), no_std)]

pub mod fadt;
pub mod hpet;
pub mod madt;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

pub use fadt::Fadt;
pub use hpet::HpetTable;
pub use madt::{IoApicEntry, LocalApicEntry, Madt, MadtEntry};
pub use rsdp::parse_rsdp;
pub use rsdt::RootTable;
pub use sdt::SdtHeader;

use core::fmt;

/// Errors from ACPI parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// RSDP signature not found or malformed.
    InvalidRsdp,
    /// An RSDP or SDT checksum did not sum to zero.
    InvalidChecksum,
    /// A table carried an unexpected signature.
    InvalidSignature,
    /// The RSDP revision is not 0 (ACPI 1.0) or 2 (ACPI 2.0+).
    InvalidRevision,
    /// A table is shorter than its mandatory fields.
    Truncated,
    /// An XSDT entry points above the 36-bit physical space PAE can reach.
    EntryOutOfReach,
}

impl fmt::Display for AcpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRsdp => write!(f, "invalid RSDP"),
            Self::InvalidChecksum => write!(f, "ACPI table checksum mismatch"),
            Self::InvalidSignature => write!(f, "unexpected ACPI table signature"),
            Self::InvalidRevision => write!(f, "unsupported RSDP revision"),
            Self::Truncated => write!(f, "ACPI table truncated"),
            Self::EntryOutOfReach => write!(f, "ACPI table above reachable physical memory"),
        }
    }
}

/// Maps physical table memory for the parser.
///
/// The kernel implementation windows tables through the pager; tests back
/// this with byte buffers.
pub trait AcpiHandler {
    /// Maps `size` bytes of physical memory at `phys` and returns a pointer
    /// to the mapping.
    ///
    /// # Safety
    ///
    /// `phys` must name real, side-effect-free table memory. The returned
    /// pointer must stay valid for the lifetime of the parse.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared helpers for building checksummed table images in tests.

    use super::AcpiHandler;
    use std::collections::HashMap;

    /// An [`AcpiHandler`] backed by a map of physical address → bytes.
    #[derive(Default)]
    pub struct BufferHandler {
        regions: HashMap<u64, Vec<u8>>,
    }

    impl BufferHandler {
        pub fn new() -> Self {
            Self::default()
        }

        /// Places `bytes` at physical address `phys`.
        pub fn install(&mut self, phys: u64, bytes: Vec<u8>) {
            self.regions.insert(phys, bytes);
        }
    }

    impl AcpiHandler for BufferHandler {
        unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8 {
            // Find the region containing [phys, phys + size).
            for (&base, bytes) in &self.regions {
                if phys >= base && phys + size as u64 <= base + bytes.len() as u64 {
                    return unsafe { bytes.as_ptr().add((phys - base) as usize) };
                }
            }
            panic!("BufferHandler: unmapped ACPI access at {phys:#x}+{size:#x}");
        }
    }

    /// Builds an SDT: header with the given signature, then `body`, with
    /// the checksum byte fixed up so the table sums to zero.
    pub fn build_sdt(signature: &[u8; 4], revision: u8, body: &[u8]) -> Vec<u8> {
        let length = (36 + body.len()) as u32;
        let mut t = Vec::new();
        t.extend_from_slice(signature);
        t.extend_from_slice(&length.to_le_bytes());
        t.push(revision);
        t.push(0); // checksum placeholder
        t.extend_from_slice(b"KAONOS"); // OEM id
        t.extend_from_slice(b"KAONTEST"); // OEM table id
        t.extend_from_slice(&1u32.to_le_bytes()); // OEM revision
        t.extend_from_slice(b"KAON"); // creator id
        t.extend_from_slice(&1u32.to_le_bytes()); // creator revision
        t.extend_from_slice(body);
        fix_checksum(&mut t, 9);
        t
    }

    /// Patches byte `at` so the whole buffer sums to zero (mod 256).
    pub fn fix_checksum(buf: &mut [u8], at: usize) {
        buf[at] = 0;
        let sum: u8 = buf.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        buf[at] = 0u8.wrapping_sub(sum);
    }
}
