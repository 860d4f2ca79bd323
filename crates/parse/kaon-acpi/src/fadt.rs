//! Fixed ACPI Description Table parsing.
//!
//! The kernel reads only the power-management register block addresses and
//! the century CMOS index from the FADT; everything else in the table
//! concerns AML interpretation, which is out of scope.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// FADT table signature.
pub const FADT_SIGNATURE: &[u8; 4] = b"FACP";

/// The fields of the FADT the kernel consumes.
#[derive(Debug, Clone, Copy)]
pub struct Fadt {
    /// Physical address of the FACS.
    pub firmware_ctrl: u32,
    /// Physical address of the DSDT.
    pub dsdt: u32,
    /// SCI interrupt number.
    pub sci_interrupt: u16,
    /// PM1a event register block port.
    pub pm1a_event_block: u32,
    /// PM1b event register block port (0 if absent).
    pub pm1b_event_block: u32,
    /// PM1a control register block port.
    pub pm1a_control_block: u32,
    /// PM1b control register block port (0 if absent).
    pub pm1b_control_block: u32,
    /// PM timer register block port.
    pub pm_timer_block: u32,
    /// RTC CMOS index of the century register (0 if absent).
    pub century: u8,
}

impl Fadt {
    /// Byte offsets of the consumed fields, relative to the table start.
    const OFF_FIRMWARE_CTRL: usize = 36;
    const OFF_DSDT: usize = 40;
    const OFF_SCI_INT: usize = 46;
    const OFF_PM1A_EVT: usize = 56;
    const OFF_PM1B_EVT: usize = 60;
    const OFF_PM1A_CNT: usize = 64;
    const OFF_PM1B_CNT: usize = 68;
    const OFF_PM_TMR: usize = 76;
    const OFF_CENTURY: usize = 108;

    /// Minimum length that covers every field above (ACPI 1.0 FADT is 116
    /// bytes).
    const MIN_LENGTH: usize = 116;

    /// Parses the FADT at `phys`.
    ///
    /// # Errors
    ///
    /// The usual signature/checksum/truncation errors.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the root table supplied this address.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != FADT_SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }
        let total_len = header.length() as usize;
        if total_len < Self::MIN_LENGTH {
            return Err(AcpiError::Truncated);
        }

        // SAFETY: total_len comes from the header.
        let table = unsafe { handler.map_physical_region(phys, total_len) };
        // SAFETY: table is valid for total_len bytes.
        if !unsafe { crate::sdt::validate_checksum(table, total_len) } {
            return Err(AcpiError::InvalidChecksum);
        }

        // SAFETY: every offset below is < MIN_LENGTH <= total_len.
        unsafe {
            Ok(Self {
                firmware_ctrl: ptr::read_unaligned(table.add(Self::OFF_FIRMWARE_CTRL).cast()),
                dsdt: ptr::read_unaligned(table.add(Self::OFF_DSDT).cast()),
                sci_interrupt: ptr::read_unaligned(table.add(Self::OFF_SCI_INT).cast()),
                pm1a_event_block: ptr::read_unaligned(table.add(Self::OFF_PM1A_EVT).cast()),
                pm1b_event_block: ptr::read_unaligned(table.add(Self::OFF_PM1B_EVT).cast()),
                pm1a_control_block: ptr::read_unaligned(table.add(Self::OFF_PM1A_CNT).cast()),
                pm1b_control_block: ptr::read_unaligned(table.add(Self::OFF_PM1B_CNT).cast()),
                pm_timer_block: ptr::read_unaligned(table.add(Self::OFF_PM_TMR).cast()),
                century: table.add(Self::OFF_CENTURY).read(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_sdt};

    fn build_fadt() -> Vec<u8> {
        // Body covering bytes 36..116 of the table.
        let mut body = vec![0u8; 116 - 36];
        body[0..4].copy_from_slice(&0x7000u32.to_le_bytes()); // firmware_ctrl
        body[4..8].copy_from_slice(&0x8000u32.to_le_bytes()); // dsdt
        body[10..12].copy_from_slice(&9u16.to_le_bytes()); // sci
        body[20..24].copy_from_slice(&0xB000u32.to_le_bytes()); // pm1a evt
        body[28..32].copy_from_slice(&0xB004u32.to_le_bytes()); // pm1a cnt
        body[40..44].copy_from_slice(&0xB008u32.to_le_bytes()); // pm timer
        body[72] = 0x32; // century register index
        build_sdt(FADT_SIGNATURE, 1, &body)
    }

    #[test]
    fn fields_extract() {
        let mut handler = BufferHandler::new();
        handler.install(0x5000, build_fadt());
        let fadt = Fadt::parse(&handler, 0x5000).unwrap();
        assert_eq!(fadt.firmware_ctrl, 0x7000);
        assert_eq!(fadt.dsdt, 0x8000);
        assert_eq!(fadt.sci_interrupt, 9);
        assert_eq!(fadt.pm1a_event_block, 0xB000);
        assert_eq!(fadt.pm1a_control_block, 0xB004);
        assert_eq!(fadt.pm_timer_block, 0xB008);
        assert_eq!(fadt.century, 0x32);
    }

    #[test]
    fn short_table_rejected() {
        let table = build_sdt(FADT_SIGNATURE, 1, &[0u8; 8]);
        let mut handler = BufferHandler::new();
        handler.install(0x5000, table);
        assert!(matches!(
            Fadt::parse(&handler, 0x5000),
            Err(AcpiError::Truncated)
        ));
    }
}
