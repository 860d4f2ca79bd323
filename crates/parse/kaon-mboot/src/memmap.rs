//! Memory-bound and memory-map tags.
//!
//! `BASIC_MEMINFO` gives the classic lower/upper memory split in KiB;
//! `MMAP` gives the full firmware memory map as an array of fixed-size
//! region entries. Only type-1 regions are usable RAM.

use bitflags::bitflags;

use crate::{Tag, le_u32, le_u64};

/// The lower/upper memory bounds from the `BASIC_MEMINFO` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicMemInfo {
    /// KiB of memory below 1 MiB (at most 640).
    pub mem_lower: u32,
    /// KiB of memory starting at 1 MiB.
    pub mem_upper: u32,
}

impl BasicMemInfo {
    /// Parses the tag payload: two little-endian `u32` values.
    pub(crate) fn from_tag(tag: &Tag<'_>) -> Option<Self> {
        if tag.payload.len() < 8 {
            return None;
        }
        Some(Self {
            mem_lower: le_u32(tag.payload, 0),
            mem_upper: le_u32(tag.payload, 4),
        })
    }
}

/// The firmware's classification of a physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Type 1: usable RAM.
    Available,
    /// Type 3: ACPI-reclaimable memory.
    AcpiReclaimable,
    /// Type 4: memory that must be preserved across hibernation.
    Nvs,
    /// Type 5: defective RAM.
    Defective,
    /// Any other type value: reserved, do not touch.
    Reserved(u32),
}

impl RegionKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::Defective,
            other => Self::Reserved(other),
        }
    }
}

bitflags! {
    /// Per-entry flag bits (multiboot2 leaves these zero today; kept so
    /// the entry layout is fully described).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// No flags defined by the current specification revision.
        const NONE = 0;
    }
}

/// One entry of the firmware memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Firmware classification.
    pub kind: RegionKind,
}

impl MemoryRegion {
    /// Returns `true` for regions the kernel may allocate from.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.kind == RegionKind::Available
    }

    /// Exclusive end address of the region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// The parsed `MMAP` tag: entry geometry plus the raw entry bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapTag<'a> {
    entry_size: usize,
    entries: &'a [u8],
}

impl<'a> MemoryMapTag<'a> {
    /// Minimum entry size: base + length + type + reserved.
    const MIN_ENTRY_SIZE: usize = 24;

    pub(crate) fn from_tag(tag: Tag<'a>) -> Option<Self> {
        if tag.payload.len() < 8 {
            return None;
        }
        let entry_size = le_u32(tag.payload, 0) as usize;
        // entry_version at offset 4 is ignored; all versions share the
        // leading fields we read.
        if entry_size < Self::MIN_ENTRY_SIZE {
            return None;
        }
        Some(Self {
            entry_size,
            entries: &tag.payload[8..],
        })
    }

    /// Returns the number of complete entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() / self.entry_size
    }

    /// Returns `true` if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over the map's regions.
    #[must_use]
    pub fn regions(&self) -> RegionIter<'a> {
        RegionIter {
            entry_size: self.entry_size,
            entries: self.entries,
            offset: 0,
        }
    }

    /// Sum of the lengths of all usable regions.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.regions()
            .filter(MemoryRegion::is_usable)
            .map(|r| r.length)
            .sum()
    }

    /// Highest exclusive end address over all usable regions.
    #[must_use]
    pub fn highest_usable_end(&self) -> u64 {
        self.regions()
            .filter(MemoryRegion::is_usable)
            .map(|r| r.end())
            .max()
            .unwrap_or(0)
    }
}

/// Iterator over [`MemoryRegion`] entries.
pub struct RegionIter<'a> {
    entry_size: usize,
    entries: &'a [u8],
    offset: usize,
}

impl Iterator for RegionIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + self.entry_size > self.entries.len() {
            return None;
        }
        let base = le_u64(self.entries, self.offset);
        let length = le_u64(self.entries, self.offset + 8);
        let kind = RegionKind::from_raw(le_u32(self.entries, self.offset + 16));
        self.offset += self.entry_size;
        Some(MemoryRegion { base, length, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_block;
    use crate::{BootInfo, TAG_BASIC_MEMINFO, TAG_MMAP};

    fn mmap_payload(entries: &[(u64, u64, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&24u32.to_le_bytes()); // entry_size
        payload.extend_from_slice(&0u32.to_le_bytes()); // entry_version
        for &(base, length, kind) in entries {
            payload.extend_from_slice(&base.to_le_bytes());
            payload.extend_from_slice(&length.to_le_bytes());
            payload.extend_from_slice(&kind.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes()); // reserved
        }
        payload
    }

    #[test]
    fn basic_meminfo_roundtrip() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&640u32.to_le_bytes());
        payload.extend_from_slice(&(255 * 1024u32).to_le_bytes());
        let block = build_block(&[(TAG_BASIC_MEMINFO, payload)]);
        let info = BootInfo::new(&block).unwrap();
        let basic = info.basic_meminfo().unwrap();
        assert_eq!(basic.mem_lower, 640);
        assert_eq!(basic.mem_upper, 255 * 1024);
    }

    #[test]
    fn regions_parse_and_classify() {
        let payload = mmap_payload(&[
            (0x0, 0x9F000, 1),
            (0x9F000, 0x61000, 2),
            (0x100000, 0xFF00000, 1),
            (0xFFF0000, 0x10000, 3),
        ]);
        let block = build_block(&[(TAG_MMAP, payload)]);
        let info = BootInfo::new(&block).unwrap();
        let map = info.memory_map().unwrap();

        assert_eq!(map.len(), 4);
        let regions: Vec<MemoryRegion> = map.regions().collect();
        assert_eq!(regions[0].kind, RegionKind::Available);
        assert_eq!(regions[1].kind, RegionKind::Reserved(2));
        assert_eq!(regions[3].kind, RegionKind::AcpiReclaimable);
        assert_eq!(map.usable_bytes(), 0x9F000 + 0xFF00000);
        assert_eq!(map.highest_usable_end(), 0x100000 + 0xFF00000);
    }

    #[test]
    fn oversized_entries_are_stepped_correctly() {
        // entry_size larger than the fields we read: iterator must stride
        // by entry_size, not by 24.
        let mut payload = Vec::new();
        payload.extend_from_slice(&32u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        for &(base, length, kind) in &[(0u64, 0x1000u64, 1u32), (0x1000, 0x2000, 1)] {
            payload.extend_from_slice(&base.to_le_bytes());
            payload.extend_from_slice(&length.to_le_bytes());
            payload.extend_from_slice(&kind.to_le_bytes());
            payload.extend_from_slice(&[0u8; 12]); // reserved + padding
        }
        let block = build_block(&[(TAG_MMAP, payload)]);
        let info = BootInfo::new(&block).unwrap();
        let map = info.memory_map().unwrap();
        assert_eq!(map.len(), 2);
        let second = map.regions().nth(1).unwrap();
        assert_eq!(second.base, 0x1000);
        assert_eq!(second.length, 0x2000);
    }

    #[test]
    fn undersized_entry_geometry_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        let block = build_block(&[(TAG_MMAP, payload)]);
        let info = BootInfo::new(&block).unwrap();
        assert!(info.memory_map().is_none());
    }
}
