//! Global descriptor table setup.
//!
//! Flat 4 GiB segmentation: kernel code/data, user code/data, and one
//! TSS descriptor per CPU. Each CPU owns its own GDT image so the TSS
//! slot can differ.

use core::mem::size_of;

/// Kernel code segment selector.
pub const KERNEL_CODE: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DATA: u16 = 0x10;
/// User code segment selector (RPL 3).
pub const USER_CODE: u16 = 0x18 | 3;
/// User data segment selector (RPL 3).
pub const USER_DATA: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

/// Number of descriptors in a CPU's GDT.
pub const GDT_ENTRIES: usize = 6;

/// One 8-byte segment descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// The null descriptor.
    pub const NULL: Self = Self(0);

    /// Builds a descriptor from base, limit, access byte, and flags
    /// nibble.
    #[must_use]
    pub fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let mut raw: u64 = 0;
        raw |= u64::from(limit & 0xFFFF);
        raw |= u64::from(base & 0xFF_FFFF) << 16;
        raw |= u64::from(access) << 40;
        raw |= u64::from((limit >> 16) & 0xF) << 48;
        raw |= u64::from(flags & 0xF) << 52;
        raw |= u64::from(base >> 24) << 56;
        Self(raw)
    }

    /// A flat 4 GiB code segment at the given privilege level.
    #[must_use]
    pub fn flat_code(dpl: u8) -> Self {
        // Present, code, readable; 4 KiB granularity, 32-bit.
        Self::new(0, 0xF_FFFF, 0x9A | (dpl << 5), 0xC)
    }

    /// A flat 4 GiB data segment at the given privilege level.
    #[must_use]
    pub fn flat_data(dpl: u8) -> Self {
        Self::new(0, 0xF_FFFF, 0x92 | (dpl << 5), 0xC)
    }

    /// A 32-bit available-TSS descriptor.
    #[must_use]
    pub fn tss(base: u32, limit: u32) -> Self {
        Self::new(base, limit, 0x89, 0x0)
    }
}

/// A CPU's GDT image.
#[repr(C, align(8))]
pub struct Gdt {
    entries: [SegmentDescriptor; GDT_ENTRIES],
}

/// The pointer operand of `lgdt`.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

impl Gdt {
    /// Builds the standard kaon GDT with the given TSS image address.
    #[must_use]
    pub fn new(tss_base: u32, tss_limit: u32) -> Self {
        Self {
            entries: [
                SegmentDescriptor::NULL,
                SegmentDescriptor::flat_code(0),
                SegmentDescriptor::flat_data(0),
                SegmentDescriptor::flat_code(3),
                SegmentDescriptor::flat_data(3),
                SegmentDescriptor::tss(tss_base, tss_limit),
            ],
        }
    }

    /// Loads this GDT and reloads every segment register.
    ///
    /// # Safety
    ///
    /// The GDT image must stay at its current address for as long as it
    /// is the active descriptor table.
    pub unsafe fn load(&'static self) {
        let pointer = GdtPointer {
            #[expect(clippy::cast_possible_truncation, reason = "GDT is 48 bytes")]
            limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
            base: core::ptr::from_ref(self) as u32,
        };
        // SAFETY: the pointer operand is valid and the selectors below
        // exist in the table just loaded; the far return reloads CS.
        unsafe {
            core::arch::asm!(
                "lgdt [{ptr}]",
                "mov ds, {sel:e}",
                "mov es, {sel:e}",
                "mov fs, {sel:e}",
                "mov gs, {sel:e}",
                "mov ss, {sel:e}",
                "push {code}",
                "lea {tmp}, [2f]",
                "push {tmp}",
                "retf",
                "2:",
                ptr = in(reg) &pointer,
                sel = in(reg) u32::from(KERNEL_DATA),
                code = in(reg) u32::from(KERNEL_CODE),
                tmp = out(reg) _,
            );
        }
    }
}
