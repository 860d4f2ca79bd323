//! HPET description-table parsing.
//!
//! The table names the event-timer block's physical address plus its
//! geometry; the register-level HPET driver lives in the kernel crate and
//! takes these values as input.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// The HPET description table.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Hardware revision and capability summary from the table header.
    pub event_timer_block_id: u32,
    /// Physical address of the 1 KiB event-timer register block.
    pub base_address: u64,
    /// Address-space of `base_address`: 0 = memory, 1 = I/O.
    pub address_space: u8,
    /// HPET sequence number (distinguishes multiple blocks).
    pub hpet_number: u8,
    /// Minimum tick in periodic mode the firmware guarantees.
    pub minimum_tick: u16,
}

impl HpetTable {
    /// Total table length: header + 20 bytes of fields.
    const LENGTH: usize = SdtHeader::SIZE + 20;

    /// Parses the HPET description table at `phys`.
    ///
    /// # Errors
    ///
    /// The usual signature/checksum/truncation errors.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the root table supplied this address.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != HPET_SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }
        let total_len = header.length() as usize;
        if total_len < Self::LENGTH {
            return Err(AcpiError::Truncated);
        }

        // SAFETY: total_len comes from the header.
        let table = unsafe { handler.map_physical_region(phys, total_len) };
        // SAFETY: table is valid for total_len bytes.
        if !unsafe { crate::sdt::validate_checksum(table, total_len) } {
            return Err(AcpiError::InvalidChecksum);
        }

        let b = SdtHeader::SIZE;
        // The base address is an ACPI generic-address structure:
        // address_space (u8), bit width/offset (u8 each), access size (u8),
        // then the 64-bit address.
        // SAFETY: all offsets below are < LENGTH <= total_len.
        unsafe {
            Ok(Self {
                event_timer_block_id: ptr::read_unaligned(table.add(b).cast()),
                address_space: table.add(b + 4).read(),
                base_address: ptr::read_unaligned(table.add(b + 8).cast()),
                hpet_number: table.add(b + 16).read(),
                minimum_tick: ptr::read_unaligned(table.add(b + 17).cast()),
            })
        }
    }

    /// Number of comparators the block advertises (bits 8..12 of the id,
    /// stored as max index).
    #[must_use]
    pub fn comparator_count(&self) -> u8 {
        (((self.event_timer_block_id >> 8) & 0x1F) + 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_sdt};

    fn build_hpet(base: u64, block_id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&block_id.to_le_bytes());
        body.push(0); // address space: memory
        body.push(64); // register bit width
        body.push(0); // register bit offset
        body.push(0); // access size
        body.extend_from_slice(&base.to_le_bytes());
        body.push(0); // hpet number
        body.extend_from_slice(&0x80u16.to_le_bytes()); // minimum tick
        body.push(0); // page protection
        build_sdt(HPET_SIGNATURE, 1, &body)
    }

    #[test]
    fn fields_extract() {
        let mut handler = BufferHandler::new();
        // Block id: two comparators (max index 1 in bits 8..12).
        handler.install(0x6000, build_hpet(0xFED0_0000, 0x0000_0100));
        let hpet = HpetTable::parse(&handler, 0x6000).unwrap();
        assert_eq!(hpet.base_address, 0xFED0_0000);
        assert_eq!(hpet.address_space, 0);
        assert_eq!(hpet.hpet_number, 0);
        assert_eq!(hpet.minimum_tick, 0x80);
        assert_eq!(hpet.comparator_count(), 2);
    }

    #[test]
    fn wrong_signature_rejected() {
        let mut handler = BufferHandler::new();
        handler.install(0x6000, build_sdt(b"APIC", 1, &[0u8; 20]));
        assert!(matches!(
            HpetTable::parse(&handler, 0x6000),
            Err(AcpiError::InvalidSignature)
        ));
    }
}
