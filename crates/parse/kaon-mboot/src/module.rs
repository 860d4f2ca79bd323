//! Boot-module tags.
//!
//! Each `MODULE` tag names one blob the loader placed in physical memory:
//! start address, exclusive end address, and an ASCIIZ command line. The
//! module loader later maps these blobs and links them as kernel modules.

use crate::{Tag, le_u32};

/// A boot module delivered by the loader.
#[derive(Debug, Clone, Copy)]
pub struct ModuleTag<'a> {
    /// Physical start address of the module blob.
    pub start: u32,
    /// Physical end address (exclusive).
    pub end: u32,
    /// Command-line bytes, without the trailing NUL.
    cmdline: &'a [u8],
}

impl<'a> ModuleTag<'a> {
    pub(crate) fn from_tag(tag: Tag<'a>) -> Option<Self> {
        if tag.payload.len() < 8 {
            return None;
        }
        let start = le_u32(tag.payload, 0);
        let end = le_u32(tag.payload, 4);
        if end < start {
            return None;
        }
        let raw = &tag.payload[8..];
        let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(Self {
            start,
            end,
            cmdline: &raw[..nul],
        })
    }

    /// Size of the module blob in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    /// The module command line as UTF-8, or `None` if it is not valid UTF-8.
    #[must_use]
    pub fn cmdline(&self) -> Option<&'a str> {
        core::str::from_utf8(self.cmdline).ok()
    }

    /// The raw command-line bytes.
    #[must_use]
    pub fn cmdline_bytes(&self) -> &'a [u8] {
        self.cmdline
    }
}
