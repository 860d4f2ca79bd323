//! Root System Description Pointer parsing and validation.
//!
//! ACPI 1.0 defines a 20-byte RSDP carrying the 32-bit RSDT address;
//! ACPI 2.0+ extends it to 36 bytes with a 64-bit XSDT address and a
//! second checksum over the extension.

use core::ptr;

use crate::{AcpiError, AcpiHandler};

/// ACPI 1.0 RSDP — 20 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp {
    /// Must be `b"RSD PTR "` (trailing space included).
    pub signature: [u8; 8],
    /// Checksum over the first 20 bytes.
    pub checksum: u8,
    /// OEM identification string.
    pub oem_id: [u8; 6],
    /// 0 for ACPI 1.0, 2 for ACPI 2.0+.
    pub revision: u8,
    /// Physical address of the RSDT.
    pub rsdt_address: u32,
}

impl Rsdp {
    /// Size of the ACPI 1.0 structure in bytes.
    pub const SIZE: usize = 20;

    /// Expected signature bytes.
    pub const SIGNATURE: &[u8; 8] = b"RSD PTR ";
}

/// ACPI 2.0+ RSDP — 36 bytes total, first 20 identical to [`Rsdp`].
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp2 {
    /// The ACPI 1.0 portion.
    pub v1: Rsdp,
    /// Total structure length (36).
    pub length: u32,
    /// Physical address of the XSDT.
    pub xsdt_address: u64,
    /// Checksum over the full 36 bytes.
    pub extended_checksum: u8,
    /// Reserved.
    pub reserved: [u8; 3],
}

impl Rsdp2 {
    /// Size of the ACPI 2.0 structure in bytes.
    pub const SIZE: usize = 36;
}

/// The root table the RSDP points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootPointer {
    /// Physical address of the RSDT or XSDT.
    pub table_address: u64,
    /// `true` when `table_address` names an XSDT (64-bit entries).
    pub is_xsdt: bool,
}

/// Parses and validates the RSDP at the given physical address.
///
/// # Errors
///
/// [`AcpiError::InvalidRsdp`] on a bad signature,
/// [`AcpiError::InvalidChecksum`] on a checksum failure, and
/// [`AcpiError::InvalidRevision`] for revisions other than 0 and 2.
pub fn parse_rsdp(handler: &impl AcpiHandler, phys: u64) -> Result<RootPointer, AcpiError> {
    // Map the larger v2 size up front; revision 0 only reads the prefix.
    // SAFETY: the caller provides the firmware RSDP address.
    let ptr = unsafe { handler.map_physical_region(phys, Rsdp2::SIZE) };

    // SAFETY: ptr is valid for at least Rsdp::SIZE bytes.
    let v1: Rsdp = unsafe { ptr::read_unaligned(ptr.cast()) };

    if &v1.signature != Rsdp::SIGNATURE {
        return Err(AcpiError::InvalidRsdp);
    }

    // SAFETY: ptr is valid for 36 bytes, so 20 is in range.
    if !unsafe { crate::sdt::validate_checksum(ptr, Rsdp::SIZE) } {
        return Err(AcpiError::InvalidChecksum);
    }

    match v1.revision {
        0 => Ok(RootPointer {
            table_address: u64::from(v1.rsdt_address),
            is_xsdt: false,
        }),
        2 => {
            // SAFETY: ptr is valid for Rsdp2::SIZE bytes.
            if !unsafe { crate::sdt::validate_checksum(ptr, Rsdp2::SIZE) } {
                return Err(AcpiError::InvalidChecksum);
            }
            // SAFETY: ptr is valid and properly sized.
            let v2: Rsdp2 = unsafe { ptr::read_unaligned(ptr.cast()) };
            Ok(RootPointer {
                table_address: v2.xsdt_address,
                is_xsdt: true,
            })
        }
        _ => Err(AcpiError::InvalidRevision),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, fix_checksum};

    fn build_rsdp_v1(rsdt: u32) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(Rsdp::SIGNATURE);
        b.push(0); // checksum placeholder
        b.extend_from_slice(b"KAONOS");
        b.push(0); // revision
        b.extend_from_slice(&rsdt.to_le_bytes());
        // Pad to the v2 map size so the handler can always map 36 bytes.
        b.resize(Rsdp2::SIZE, 0);
        fix_checksum(&mut b[..Rsdp::SIZE], 8);
        b
    }

    fn build_rsdp_v2(xsdt: u64) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(Rsdp::SIGNATURE);
        b.push(0);
        b.extend_from_slice(b"KAONOS");
        b.push(2); // revision
        b.extend_from_slice(&0u32.to_le_bytes()); // rsdt (unused)
        b.extend_from_slice(&36u32.to_le_bytes()); // length
        b.extend_from_slice(&xsdt.to_le_bytes());
        b.push(0); // extended checksum placeholder
        b.extend_from_slice(&[0u8; 3]);
        fix_checksum(&mut b[..Rsdp::SIZE], 8);
        fix_checksum(&mut b, 32);
        b
    }

    #[test]
    fn v1_yields_rsdt() {
        let mut handler = BufferHandler::new();
        handler.install(0xE0000, build_rsdp_v1(0x7FE0000));
        let root = parse_rsdp(&handler, 0xE0000).unwrap();
        assert_eq!(root.table_address, 0x7FE0000);
        assert!(!root.is_xsdt);
    }

    #[test]
    fn v2_yields_xsdt() {
        let mut handler = BufferHandler::new();
        handler.install(0xE0000, build_rsdp_v2(0x7FE8000));
        let root = parse_rsdp(&handler, 0xE0000).unwrap();
        assert_eq!(root.table_address, 0x7FE8000);
        assert!(root.is_xsdt);
    }

    #[test]
    fn bad_signature_rejected() {
        let mut rsdp = build_rsdp_v1(0x1000);
        rsdp[0] = b'X';
        let mut handler = BufferHandler::new();
        handler.install(0xE0000, rsdp);
        assert_eq!(parse_rsdp(&handler, 0xE0000), Err(AcpiError::InvalidRsdp));
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut rsdp = build_rsdp_v1(0x1000);
        rsdp[9] ^= 0x55; // corrupt OEM id without touching the checksum
        let mut handler = BufferHandler::new();
        handler.install(0xE0000, rsdp);
        assert_eq!(
            parse_rsdp(&handler, 0xE0000),
            Err(AcpiError::InvalidChecksum)
        );
    }

    #[test]
    fn unknown_revision_rejected() {
        let mut rsdp = build_rsdp_v1(0x1000);
        rsdp[15] = 7;
        fix_checksum(&mut rsdp[..Rsdp::SIZE], 8);
        let mut handler = BufferHandler::new();
        handler.install(0xE0000, rsdp);
        assert_eq!(
            parse_rsdp(&handler, 0xE0000),
            Err(AcpiError::InvalidRevision)
        );
    }
}
