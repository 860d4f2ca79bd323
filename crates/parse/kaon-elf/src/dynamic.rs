//! Dynamic-segment parsing.
//!
//! The dynamic segment is an array of `(tag, value)` pairs terminated by
//! `DT_NULL`. [`DynamicInfo`] collects the entries the linker consumes into
//! one struct so later passes need not rescan the array.

use crate::{ElfError, le_u32};

/// Dynamic tag: terminator.
pub const DT_NULL: u32 = 0;
/// Dynamic tag: symbol hash table address.
pub const DT_HASH: u32 = 4;
/// Dynamic tag: string table address.
pub const DT_STRTAB: u32 = 5;
/// Dynamic tag: symbol table address.
pub const DT_SYMTAB: u32 = 6;
/// Dynamic tag: string table size.
pub const DT_STRSZ: u32 = 10;
/// Dynamic tag: symbol entry size.
pub const DT_SYMENT: u32 = 11;
/// Dynamic tag: init function address.
pub const DT_INIT: u32 = 12;
/// Dynamic tag: fini function address.
pub const DT_FINI: u32 = 13;
/// Dynamic tag: REL table address.
pub const DT_REL: u32 = 17;
/// Dynamic tag: REL table size in bytes.
pub const DT_RELSZ: u32 = 18;
/// Dynamic tag: REL entry size.
pub const DT_RELENT: u32 = 19;
/// Dynamic tag: PLT relocation kind (`DT_REL` or `DT_RELA`).
pub const DT_PLTREL: u32 = 20;
/// Dynamic tag: PLT relocation table address.
pub const DT_JMPREL: u32 = 23;
/// Dynamic tag: PLT relocation table size in bytes.
pub const DT_PLTRELSZ: u32 = 2;
/// Dynamic tag: init-array address.
pub const DT_INIT_ARRAY: u32 = 25;
/// Dynamic tag: fini-array address.
pub const DT_FINI_ARRAY: u32 = 26;
/// Dynamic tag: init-array size in bytes.
pub const DT_INIT_ARRAYSZ: u32 = 27;
/// Dynamic tag: fini-array size in bytes.
pub const DT_FINI_ARRAYSZ: u32 = 28;
/// Dynamic tag: preinit-array address.
pub const DT_PREINIT_ARRAY: u32 = 32;
/// Dynamic tag: preinit-array size in bytes.
pub const DT_PREINIT_ARRAYSZ: u32 = 33;

/// One `(tag, value)` pair from the dynamic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynEntry {
    /// The `d_tag` field.
    pub tag: u32,
    /// The `d_val` / `d_ptr` union (identical layout on ELF32).
    pub value: u32,
}

/// Iterator over dynamic entries, stopping at `DT_NULL`.
pub struct DynIter<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> DynIter<'a> {
    /// Size of one ELF32 dynamic entry.
    const ENTRY_SIZE: usize = 8;

    /// Creates an iterator over `[offset, end)` of `data`.
    pub fn new(data: &'a [u8], offset: usize, end: usize) -> Self {
        Self { data, offset, end }
    }
}

impl Iterator for DynIter<'_> {
    type Item = DynEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + Self::ENTRY_SIZE > self.end || self.offset + Self::ENTRY_SIZE > self.data.len() {
            return None;
        }
        let tag = le_u32(self.data, self.offset);
        let value = le_u32(self.data, self.offset + 4);
        if tag == DT_NULL {
            return None;
        }
        self.offset += Self::ENTRY_SIZE;
        Some(DynEntry { tag, value })
    }
}

/// The dynamic-segment entries the module linker consumes, collected.
///
/// Addresses are module-relative; the loader adds the load base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    /// `DT_SYMTAB` address.
    pub symtab: u32,
    /// `DT_SYMENT` entry size.
    pub syment: u32,
    /// `DT_STRTAB` address.
    pub strtab: u32,
    /// `DT_STRSZ` size.
    pub strsz: u32,
    /// `DT_HASH` address (0 if absent).
    pub hash: u32,
    /// `DT_REL` address (0 if absent).
    pub rel: u32,
    /// `DT_RELSZ` size in bytes.
    pub relsz: u32,
    /// `DT_JMPREL` address (0 if absent).
    pub jmprel: u32,
    /// `DT_PLTRELSZ` size in bytes.
    pub pltrelsz: u32,
    /// `DT_INIT` address (0 if absent).
    pub init: u32,
    /// `DT_FINI` address (0 if absent).
    pub fini: u32,
    /// `DT_PREINIT_ARRAY` address and byte size.
    pub preinit_array: (u32, u32),
    /// `DT_INIT_ARRAY` address and byte size.
    pub init_array: (u32, u32),
    /// `DT_FINI_ARRAY` address and byte size.
    pub fini_array: (u32, u32),
}

impl DynamicInfo {
    /// Collects the known tags from a dynamic-entry stream.
    ///
    /// # Errors
    ///
    /// [`ElfError::MissingDynamicEntry`] when the symbol or string table
    /// is absent — a module without those cannot be linked.
    pub fn collect(entries: impl Iterator<Item = DynEntry>) -> Result<Self, ElfError> {
        let mut info = Self::default();
        for e in entries {
            match e.tag {
                DT_SYMTAB => info.symtab = e.value,
                DT_SYMENT => info.syment = e.value,
                DT_STRTAB => info.strtab = e.value,
                DT_STRSZ => info.strsz = e.value,
                DT_HASH => info.hash = e.value,
                DT_REL => info.rel = e.value,
                DT_RELSZ => info.relsz = e.value,
                DT_JMPREL => info.jmprel = e.value,
                DT_PLTRELSZ => info.pltrelsz = e.value,
                DT_INIT => info.init = e.value,
                DT_FINI => info.fini = e.value,
                DT_PREINIT_ARRAY => info.preinit_array.0 = e.value,
                DT_PREINIT_ARRAYSZ => info.preinit_array.1 = e.value,
                DT_INIT_ARRAY => info.init_array.0 = e.value,
                DT_INIT_ARRAYSZ => info.init_array.1 = e.value,
                DT_FINI_ARRAY => info.fini_array.0 = e.value,
                DT_FINI_ARRAYSZ => info.fini_array.1 = e.value,
                _ => {}
            }
        }
        if info.symtab == 0 {
            return Err(ElfError::MissingDynamicEntry(DT_SYMTAB));
        }
        if info.strtab == 0 {
            return Err(ElfError::MissingDynamicEntry(DT_STRTAB));
        }
        Ok(info)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Appends one raw dynamic entry to `out`.
    pub fn push_dyn(out: &mut Vec<u8>, tag: u32, value: u32) {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::push_dyn;

    fn dyn_stream(entries: &[(u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(tag, value) in entries {
            push_dyn(&mut out, tag, value);
        }
        push_dyn(&mut out, DT_NULL, 0);
        out
    }

    #[test]
    fn collects_linker_tags() {
        let data = dyn_stream(&[
            (DT_SYMTAB, 0x100),
            (DT_SYMENT, 16),
            (DT_STRTAB, 0x400),
            (DT_STRSZ, 0x80),
            (DT_HASH, 0x500),
            (DT_REL, 0x600),
            (DT_RELSZ, 64),
            (DT_INIT, 0x700),
            (DT_INIT_ARRAY, 0x800),
            (DT_INIT_ARRAYSZ, 8),
        ]);
        let info =
            DynamicInfo::collect(DynIter::new(&data, 0, data.len())).unwrap();
        assert_eq!(info.symtab, 0x100);
        assert_eq!(info.syment, 16);
        assert_eq!(info.strtab, 0x400);
        assert_eq!(info.hash, 0x500);
        assert_eq!(info.rel, 0x600);
        assert_eq!(info.relsz, 64);
        assert_eq!(info.init, 0x700);
        assert_eq!(info.init_array, (0x800, 8));
        assert_eq!(info.fini, 0);
    }

    #[test]
    fn stops_at_null_tag() {
        let mut data = dyn_stream(&[(DT_SYMTAB, 1), (DT_STRTAB, 2)]);
        push_dyn(&mut data, DT_HASH, 0x9999); // after DT_NULL, invisible
        let info =
            DynamicInfo::collect(DynIter::new(&data, 0, data.len())).unwrap();
        assert_eq!(info.hash, 0);
    }

    #[test]
    fn missing_symtab_rejected() {
        let data = dyn_stream(&[(DT_STRTAB, 2)]);
        assert_eq!(
            DynamicInfo::collect(DynIter::new(&data, 0, data.len())),
            Err(ElfError::MissingDynamicEntry(DT_SYMTAB))
        );
    }

    #[test]
    fn missing_strtab_rejected() {
        let data = dyn_stream(&[(DT_SYMTAB, 1)]);
        assert_eq!(
            DynamicInfo::collect(DynIter::new(&data, 0, data.len())),
            Err(ElfError::MissingDynamicEntry(DT_STRTAB))
        );
    }
}
