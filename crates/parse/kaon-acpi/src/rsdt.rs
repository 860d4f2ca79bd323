//! RSDT / XSDT entry enumeration.
//!
//! The root table is an SDT whose body is an array of physical pointers to
//! the other tables: 32-bit entries in the RSDT, 64-bit in the XSDT. The
//! kernel walks the entries and matches each target's signature.

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// A validated root table (RSDT or XSDT) ready for entry iteration.
pub struct RootTable {
    entries_ptr: *const u8,
    entry_count: usize,
    entry_size: usize,
}

impl RootTable {
    /// RSDT table signature.
    pub const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";
    /// XSDT table signature.
    pub const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";

    /// Parses the root table at `phys`.
    ///
    /// # Errors
    ///
    /// Signature and checksum failures propagate as the corresponding
    /// [`AcpiError`] values; a root table shorter than its header is
    /// [`AcpiError::Truncated`].
    pub fn parse(handler: &impl AcpiHandler, phys: u64, is_xsdt: bool) -> Result<Self, AcpiError> {
        // SAFETY: the RSDP supplied this address.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        let expected = if is_xsdt {
            Self::XSDT_SIGNATURE
        } else {
            Self::RSDT_SIGNATURE
        };
        if &header.signature() != expected {
            return Err(AcpiError::InvalidSignature);
        }

        let total_len = header.length() as usize;
        if total_len < SdtHeader::SIZE {
            return Err(AcpiError::Truncated);
        }

        // SAFETY: total_len comes from the table's own header.
        let table_ptr = unsafe { handler.map_physical_region(phys, total_len) };
        // SAFETY: table_ptr is valid for total_len bytes.
        if !unsafe { crate::sdt::validate_checksum(table_ptr, total_len) } {
            return Err(AcpiError::InvalidChecksum);
        }

        let entry_size = if is_xsdt { 8 } else { 4 };
        let body_len = total_len - SdtHeader::SIZE;
        Ok(Self {
            // SAFETY: SdtHeader::SIZE <= total_len.
            entries_ptr: unsafe { table_ptr.add(SdtHeader::SIZE) },
            entry_count: body_len / entry_size,
            entry_size,
        })
    }

    /// Returns the number of table pointers in the root table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Returns `true` when the root table carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Returns the physical address stored in entry `index`.
    ///
    /// # Errors
    ///
    /// [`AcpiError::EntryOutOfReach`] when an XSDT entry does not fit the
    /// 36-bit physical space this kernel can address.
    pub fn entry(&self, index: usize) -> Result<u64, AcpiError> {
        assert!(index < self.entry_count, "root table entry out of range");
        let offset = index * self.entry_size;
        let addr = if self.entry_size == 4 {
            // SAFETY: offset + 4 <= body length by construction.
            u64::from(unsafe {
                core::ptr::read_unaligned(self.entries_ptr.add(offset).cast::<u32>())
            })
        } else {
            // SAFETY: offset + 8 <= body length by construction.
            unsafe { core::ptr::read_unaligned(self.entries_ptr.add(offset).cast::<u64>()) }
        };
        if addr > 0x0000_000F_FFFF_FFFF {
            return Err(AcpiError::EntryOutOfReach);
        }
        Ok(addr)
    }

    /// Finds the first entry whose target table carries `signature`.
    ///
    /// Entries with unreadable addresses are skipped; a missing table is
    /// simply `None`.
    pub fn find(&self, handler: &impl AcpiHandler, signature: &[u8; 4]) -> Option<u64> {
        for index in 0..self.entry_count {
            let Ok(addr) = self.entry(index) else {
                continue;
            };
            // SAFETY: addr came from the validated root table.
            let header_ptr = unsafe { handler.map_physical_region(addr, SdtHeader::SIZE) };
            // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
            let header = unsafe { SdtHeader::read_from(header_ptr) };
            if &header.signature() == signature {
                return Some(addr);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_sdt};

    fn build_rsdt(entries: &[u32]) -> Vec<u8> {
        let mut body = Vec::new();
        for e in entries {
            body.extend_from_slice(&e.to_le_bytes());
        }
        build_sdt(b"RSDT", 1, &body)
    }

    fn build_xsdt(entries: &[u64]) -> Vec<u8> {
        let mut body = Vec::new();
        for e in entries {
            body.extend_from_slice(&e.to_le_bytes());
        }
        build_sdt(b"XSDT", 1, &body)
    }

    #[test]
    fn rsdt_entries_enumerate() {
        let mut handler = BufferHandler::new();
        handler.install(0x1000, build_rsdt(&[0x2000, 0x3000]));
        let root = RootTable::parse(&handler, 0x1000, false).unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root.entry(0).unwrap(), 0x2000);
        assert_eq!(root.entry(1).unwrap(), 0x3000);
    }

    #[test]
    fn find_matches_target_signature() {
        let mut handler = BufferHandler::new();
        handler.install(0x1000, build_rsdt(&[0x2000, 0x3000]));
        handler.install(0x2000, build_sdt(b"FACP", 1, &[0u8; 8]));
        handler.install(0x3000, build_sdt(b"APIC", 1, &[0u8; 8]));
        let root = RootTable::parse(&handler, 0x1000, false).unwrap();
        assert_eq!(root.find(&handler, b"APIC"), Some(0x3000));
        assert_eq!(root.find(&handler, b"HPET"), None);
    }

    #[test]
    fn xsdt_entry_above_pae_reach_rejected() {
        let mut handler = BufferHandler::new();
        handler.install(0x1000, build_xsdt(&[0x10_0000_0000]));
        let root = RootTable::parse(&handler, 0x1000, true).unwrap();
        assert_eq!(root.entry(0), Err(AcpiError::EntryOutOfReach));
    }

    #[test]
    fn corrupt_checksum_is_fatal() {
        let mut rsdt = build_rsdt(&[0x2000]);
        let last = rsdt.len() - 1;
        rsdt[last] ^= 1;
        let mut handler = BufferHandler::new();
        handler.install(0x1000, rsdt);
        assert!(matches!(
            RootTable::parse(&handler, 0x1000, false),
            Err(AcpiError::InvalidChecksum)
        ));
    }

    #[test]
    fn wrong_root_signature_rejected() {
        let mut handler = BufferHandler::new();
        handler.install(0x1000, build_rsdt(&[]));
        assert!(matches!(
            RootTable::parse(&handler, 0x1000, true),
            Err(AcpiError::InvalidSignature)
        ));
    }
}
