//! Multiple APIC Description Table parsing.
//!
//! The MADT enumerates the interrupt hardware: one local APIC entry per
//! logical CPU, the IO-APICs with their global-interrupt bases, and the
//! legacy IRQ overrides. The bring-up sequencer walks these entries to
//! discover every application processor.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// MADT table signature.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// Bit 0 of the MADT flags: dual 8259 PICs are wired and must be masked.
pub const MADT_PCAT_COMPAT: u32 = 1 << 0;

/// A parsed MADT.
pub struct Madt {
    /// Physical address of the local-APIC register block.
    pub local_apic_address: u32,
    /// MADT flags.
    pub flags: u32,
    entries_ptr: *const u8,
    entries_len: usize,
}

impl Madt {
    /// Fixed fields after the SDT header: local-APIC address + flags.
    const FIELDS_SIZE: usize = 8;

    /// Parses the MADT at `phys`.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] or [`AcpiError::InvalidChecksum`] on
    /// a malformed table.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the root table supplied this address.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != MADT_SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }

        let total_len = header.length() as usize;
        if total_len < SdtHeader::SIZE + Self::FIELDS_SIZE {
            return Err(AcpiError::Truncated);
        }

        // SAFETY: total_len comes from the header.
        let table_ptr = unsafe { handler.map_physical_region(phys, total_len) };
        // SAFETY: table_ptr is valid for total_len bytes.
        if !unsafe { crate::sdt::validate_checksum(table_ptr, total_len) } {
            return Err(AcpiError::InvalidChecksum);
        }

        // SAFETY: the length check above covers the fixed fields.
        let local_apic_address =
            unsafe { ptr::read_unaligned(table_ptr.add(SdtHeader::SIZE).cast::<u32>()) };
        // SAFETY: same bound.
        let flags =
            unsafe { ptr::read_unaligned(table_ptr.add(SdtHeader::SIZE + 4).cast::<u32>()) };

        let entries_offset = SdtHeader::SIZE + Self::FIELDS_SIZE;
        Ok(Self {
            local_apic_address,
            flags,
            // SAFETY: entries_offset <= total_len.
            entries_ptr: unsafe { table_ptr.add(entries_offset) },
            entries_len: total_len - entries_offset,
        })
    }

    /// Returns an iterator over the interrupt-controller entries.
    #[must_use]
    pub fn entries(&self) -> MadtEntryIter {
        MadtEntryIter {
            ptr: self.entries_ptr,
            remaining: self.entries_len,
        }
    }

    /// Counts the enabled local APICs (the usable CPUs).
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.entries()
            .filter(|e| matches!(e, MadtEntry::LocalApic(l) if l.is_enabled()))
            .count()
    }
}

/// Processor local APIC (entry type 0).
#[derive(Debug, Clone, Copy)]
pub struct LocalApicEntry {
    /// ACPI processor UID.
    pub processor_id: u8,
    /// The CPU's local-APIC id; doubles as the kernel CPU index.
    pub apic_id: u8,
    /// Entry flags (bit 0: enabled, bit 1: online-capable).
    pub flags: u32,
}

impl LocalApicEntry {
    /// Returns `true` when firmware marks this CPU usable.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// IO-APIC (entry type 1).
#[derive(Debug, Clone, Copy)]
pub struct IoApicEntry {
    /// The IO-APIC id.
    pub id: u8,
    /// Physical address of the IO-APIC register pair.
    pub address: u32,
    /// First global system interrupt this IO-APIC serves.
    pub gsi_base: u32,
}

/// Interrupt source override (entry type 2).
#[derive(Debug, Clone, Copy)]
pub struct SourceOverrideEntry {
    /// ISA bus (always 0).
    pub bus: u8,
    /// ISA IRQ number being remapped.
    pub source: u8,
    /// Global system interrupt it maps to.
    pub gsi: u32,
    /// MPS INTI polarity/trigger flags.
    pub flags: u16,
}

/// One interrupt-controller structure from the MADT.
#[derive(Debug, Clone, Copy)]
pub enum MadtEntry {
    /// Type 0: processor local APIC.
    LocalApic(LocalApicEntry),
    /// Type 1: IO-APIC.
    IoApic(IoApicEntry),
    /// Type 2: interrupt source override.
    SourceOverride(SourceOverrideEntry),
    /// Any entry type the kernel does not consume.
    Unknown {
        /// The entry type byte.
        entry_type: u8,
        /// The entry length including its 2-byte header.
        length: u8,
    },
}

/// Iterator over MADT interrupt-controller entries.
pub struct MadtEntryIter {
    ptr: *const u8,
    remaining: usize,
}

impl Iterator for MadtEntryIter {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        // Each entry starts with type (u8) + length (u8).
        if self.remaining < 2 {
            return None;
        }

        // SAFETY: at least 2 bytes remain.
        let entry_type = unsafe { self.ptr.read() };
        // SAFETY: same bound.
        let length = unsafe { self.ptr.add(1).read() } as usize;

        if length < 2 || length > self.remaining {
            return None;
        }

        let entry = match entry_type {
            // Type 0: local APIC — 8 bytes.
            0 if length >= 8 => {
                // SAFETY: length was verified against the remaining bytes.
                unsafe {
                    MadtEntry::LocalApic(LocalApicEntry {
                        processor_id: self.ptr.add(2).read(),
                        apic_id: self.ptr.add(3).read(),
                        flags: ptr::read_unaligned(self.ptr.add(4).cast::<u32>()),
                    })
                }
            }

            // Type 1: IO-APIC — 12 bytes (byte 3 reserved).
            1 if length >= 12 => {
                // SAFETY: length was verified.
                unsafe {
                    MadtEntry::IoApic(IoApicEntry {
                        id: self.ptr.add(2).read(),
                        address: ptr::read_unaligned(self.ptr.add(4).cast::<u32>()),
                        gsi_base: ptr::read_unaligned(self.ptr.add(8).cast::<u32>()),
                    })
                }
            }

            // Type 2: interrupt source override — 10 bytes.
            2 if length >= 10 => {
                // SAFETY: length was verified.
                unsafe {
                    MadtEntry::SourceOverride(SourceOverrideEntry {
                        bus: self.ptr.add(2).read(),
                        source: self.ptr.add(3).read(),
                        gsi: ptr::read_unaligned(self.ptr.add(4).cast::<u32>()),
                        flags: ptr::read_unaligned(self.ptr.add(8).cast::<u16>()),
                    })
                }
            }

            #[expect(
                clippy::cast_possible_truncation,
                reason = "entry length was read from a u8 field"
            )]
            _ => MadtEntry::Unknown {
                entry_type,
                length: length as u8,
            },
        };

        // SAFETY: length <= remaining, so the advanced pointer stays in
        // bounds.
        self.ptr = unsafe { self.ptr.add(length) };
        self.remaining -= length;

        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_sdt};

    fn lapic(processor_id: u8, apic_id: u8, flags: u32) -> Vec<u8> {
        let mut e = vec![0u8, 8, processor_id, apic_id];
        e.extend_from_slice(&flags.to_le_bytes());
        e
    }

    fn ioapic(id: u8, address: u32, gsi_base: u32) -> Vec<u8> {
        let mut e = vec![1u8, 12, id, 0];
        e.extend_from_slice(&address.to_le_bytes());
        e.extend_from_slice(&gsi_base.to_le_bytes());
        e
    }

    fn build_madt(lapic_addr: u32, flags: u32, entries: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&lapic_addr.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        for e in entries {
            body.extend_from_slice(e);
        }
        build_sdt(MADT_SIGNATURE, 3, &body)
    }

    #[test]
    fn enumerates_cpus_and_ioapics() {
        let table = build_madt(
            0xFEE0_0000,
            MADT_PCAT_COMPAT,
            &[
                lapic(0, 0, 1),
                lapic(1, 1, 1),
                lapic(2, 2, 0), // disabled
                ioapic(0, 0xFEC0_0000, 0),
            ],
        );
        let mut handler = BufferHandler::new();
        handler.install(0x4000, table);
        let madt = Madt::parse(&handler, 0x4000).unwrap();

        assert_eq!(madt.local_apic_address, 0xFEE0_0000);
        assert_eq!(madt.flags & MADT_PCAT_COMPAT, MADT_PCAT_COMPAT);
        assert_eq!(madt.entries().count(), 4);
        assert_eq!(madt.cpu_count(), 2);

        let io = madt
            .entries()
            .find_map(|e| match e {
                MadtEntry::IoApic(io) => Some(io),
                _ => None,
            })
            .unwrap();
        assert_eq!(io.address, 0xFEC0_0000);
        assert_eq!(io.gsi_base, 0);
    }

    #[test]
    fn source_override_parses() {
        let mut entry = vec![2u8, 10, 0, 0];
        entry.extend_from_slice(&2u32.to_le_bytes()); // IRQ0 -> GSI2
        entry.extend_from_slice(&0u16.to_le_bytes());
        let table = build_madt(0xFEE0_0000, 0, &[entry]);
        let mut handler = BufferHandler::new();
        handler.install(0x4000, table);
        let madt = Madt::parse(&handler, 0x4000).unwrap();
        let ovr = madt
            .entries()
            .find_map(|e| match e {
                MadtEntry::SourceOverride(o) => Some(o),
                _ => None,
            })
            .unwrap();
        assert_eq!(ovr.source, 0);
        assert_eq!(ovr.gsi, 2);
    }

    #[test]
    fn unknown_entry_is_skipped_not_fatal() {
        let unknown = vec![9u8, 6, 0, 0, 0, 0];
        let table = build_madt(0xFEE0_0000, 0, &[unknown, lapic(0, 0, 1)]);
        let mut handler = BufferHandler::new();
        handler.install(0x4000, table);
        let madt = Madt::parse(&handler, 0x4000).unwrap();
        assert_eq!(madt.cpu_count(), 1);
        assert!(matches!(
            madt.entries().next().unwrap(),
            MadtEntry::Unknown { entry_type: 9, .. }
        ));
    }

    #[test]
    fn truncated_entry_halts_iteration() {
        // An entry whose declared length overruns the table.
        let bad = vec![0u8, 200];
        let table = build_madt(0xFEE0_0000, 0, &[lapic(0, 0, 1), bad]);
        let mut handler = BufferHandler::new();
        handler.install(0x4000, table);
        let madt = Madt::parse(&handler, 0x4000).unwrap();
        assert_eq!(madt.entries().count(), 1);
    }

    #[test]
    fn wrong_signature_rejected() {
        let table = build_sdt(b"FACP", 1, &[0u8; 8]);
        let mut handler = BufferHandler::new();
        handler.install(0x4000, table);
        assert!(matches!(
            Madt::parse(&handler, 0x4000),
            Err(AcpiError::InvalidSignature)
        ));
    }
}
