//! PAE page-table management.
//!
//! The address space is a 4-entry PDPT over 512-entry page directories
//! and page tables, with 4 KiB and 2 MiB mappings. Table memory and TLB
//! maintenance go through [`TableProvider`], which the kernel implements
//! with the recursive-slot window and `invlpg`; host tests substitute a
//! map of boxed tables.
//!
//! Mapping over an already-present entry overwrites it without freeing
//! the displaced frame — tracking that frame is the caller's
//! responsibility.

use bitflags::bitflags;
use kaon_core::addr::{HUGE_PAGE_SIZE, PAGE_SIZE, PhysAddr, VirtAddr};

/// Entries per page directory / page table.
pub const TABLE_ENTRIES: usize = 512;

/// Entries in the PDPT.
pub const PDPT_ENTRIES: usize = 4;

bitflags! {
    /// IA-32 PAE page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// The mapping is present.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITABLE = 1 << 1;
        /// User-mode access is allowed.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled (device memory).
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
        /// The PD entry maps a 2 MiB page.
        const HUGE = 1 << 7;
        /// Not flushed on address-space switch.
        const GLOBAL = 1 << 8;
        /// No instruction fetch (requires NX-enabled PAE).
        const NO_EXECUTE = 1 << 63;
    }
}

/// Mask extracting the physical address from an entry.
const ENTRY_ADDR_MASK: u64 = 0x0000_000F_FFFF_F000;

/// One 512-entry paging structure (PD or PT).
#[repr(C, align(4096))]
pub struct PageTable {
    /// The raw entries.
    pub entries: [u64; TABLE_ENTRIES],
}

impl PageTable {
    /// An empty table.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; TABLE_ENTRIES],
        }
    }
}

bitflags! {
    /// Per-address-space flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// The context maps the kernel half only.
        const KERNEL = 1 << 0;
    }
}

/// A per-address-space handle: the PDPT location plus flags.
///
/// One global kernel context always exists; per-process contexts share
/// its kernel half.
#[derive(Debug, Clone, Copy)]
pub struct MemoryContext {
    /// Physical address of the 4-entry PDPT.
    pub pdpt: PhysAddr,
    /// Context flags.
    pub flags: ContextFlags,
}

/// Errors from the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerError {
    /// A page-table frame could not be allocated.
    TableAllocFailed,
    /// A backing frame could not be allocated (`use_all`).
    FrameAllocFailed,
    /// The caller passed bounds that are not page-aligned.
    Unaligned,
}

impl core::fmt::Display for PagerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TableAllocFailed => write!(f, "page-table allocation failed"),
            Self::FrameAllocFailed => write!(f, "backing-frame allocation failed"),
            Self::Unaligned => write!(f, "range is not page-aligned"),
        }
    }
}

/// Supplies table memory and TLB maintenance to the pager.
pub trait TableProvider {
    /// Allocates a zeroed 4 KiB table frame.
    fn allocate_table(&mut self) -> Option<PhysAddr>;

    /// Returns a pointer to the paging structure at `phys`.
    ///
    /// In the kernel this windows the frame through the recursive slot;
    /// the pointer stays valid until the next provider call.
    fn table_mut(&mut self, phys: PhysAddr) -> *mut PageTable;

    /// Invalidates the TLB entry covering `va`.
    fn flush(&self, va: VirtAddr);
}

/// Supplies backing frames to [`Pager::use_all`].
pub trait FrameSource {
    /// Allocates `2^order` physically contiguous frames.
    fn allocate_frames(&mut self, order: u8) -> Option<PhysAddr>;
}

/// The `[base, limit)` decomposition used by [`Pager::use_all`]: an
/// unaligned-low small-page slice, an aligned 2 MiB middle, and an
/// unaligned-high small-page slice. The three parts cover the input
/// exactly, with no gap and no overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSplit {
    /// Small pages in `[base, huge.0)`.
    pub low: (u32, u32),
    /// Huge pages in `[ceil(base, 2M), floor(limit, 2M))`.
    pub huge: (u32, u32),
    /// Small pages in `[huge.1, limit)`.
    pub high: (u32, u32),
}

/// Splits a page-aligned `[base, limit)` range for mapping.
#[must_use]
pub fn split_range(base: u32, limit: u32) -> RangeSplit {
    debug_assert!(base <= limit);
    let mid_lo = base
        .checked_add(HUGE_PAGE_SIZE - 1)
        .map_or(limit, |v| (v & !(HUGE_PAGE_SIZE - 1)).min(limit));
    let mid_hi = (limit & !(HUGE_PAGE_SIZE - 1)).max(mid_lo);
    if mid_hi <= mid_lo {
        // Too small for any huge page: everything is small.
        return RangeSplit {
            low: (base, limit),
            huge: (limit, limit),
            high: (limit, limit),
        };
    }
    RangeSplit {
        low: (base, mid_lo),
        huge: (mid_lo, mid_hi),
        high: (mid_hi, limit),
    }
}

/// The page-table manager for one address space.
pub struct Pager<'a, P: TableProvider> {
    provider: &'a mut P,
    pdpt: PhysAddr,
}

impl<'a, P: TableProvider> Pager<'a, P> {
    /// Opens the context for mapping operations.
    pub fn new(provider: &'a mut P, context: &MemoryContext) -> Self {
        Self {
            provider,
            pdpt: context.pdpt,
        }
    }

    /// Walks to the page directory for `va`, allocating it if absent.
    fn directory(&mut self, va: VirtAddr) -> Result<PhysAddr, PagerError> {
        let pdpt = self.provider.table_mut(self.pdpt);
        // SAFETY: the provider hands out a live table pointer.
        let entry = unsafe { (*pdpt).entries[va.pdpt_index()] };
        if entry & PageFlags::PRESENT.bits() != 0 {
            return Ok(PhysAddr::new(entry & ENTRY_ADDR_MASK));
        }
        let pd = self
            .provider
            .allocate_table()
            .ok_or(PagerError::TableAllocFailed)?;
        let pdpt = self.provider.table_mut(self.pdpt);
        // PDPT entries only carry present + cache bits on IA-32 PAE.
        // SAFETY: live table pointer from the provider.
        unsafe {
            (*pdpt).entries[va.pdpt_index()] = pd.as_u64() | PageFlags::PRESENT.bits();
        }
        Ok(pd)
    }

    /// Walks to the leaf page table for `va`, allocating levels as
    /// needed. A huge mapping in the way is displaced (not freed).
    fn leaf_table(&mut self, va: VirtAddr) -> Result<PhysAddr, PagerError> {
        let pd_phys = self.directory(va)?;
        let pd = self.provider.table_mut(pd_phys);
        // SAFETY: live table pointer from the provider.
        let entry = unsafe { (*pd).entries[va.pd_index()] };
        let present = entry & PageFlags::PRESENT.bits() != 0;
        let huge = entry & PageFlags::HUGE.bits() != 0;
        if present && !huge {
            return Ok(PhysAddr::new(entry & ENTRY_ADDR_MASK));
        }
        let pt = self
            .provider
            .allocate_table()
            .ok_or(PagerError::TableAllocFailed)?;
        let pd = self.provider.table_mut(pd_phys);
        // SAFETY: live table pointer from the provider.
        unsafe {
            (*pd).entries[va.pd_index()] =
                pt.as_u64() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
        }
        Ok(pt)
    }

    /// Maps one 4 KiB page.
    ///
    /// # Errors
    ///
    /// [`PagerError::TableAllocFailed`] when an intermediate table
    /// cannot be allocated.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result<(), PagerError> {
        debug_assert!(va.is_aligned(PAGE_SIZE));
        let pt_phys = self.leaf_table(va)?;
        let pt = self.provider.table_mut(pt_phys);
        // SAFETY: live table pointer from the provider.
        unsafe {
            (*pt).entries[va.pt_index()] =
                (pa.as_u64() & ENTRY_ADDR_MASK) | flags.bits() | PageFlags::PRESENT.bits();
        }
        self.provider.flush(va);
        Ok(())
    }

    /// Maps one 2 MiB page at a 2 MiB-aligned address.
    ///
    /// # Errors
    ///
    /// [`PagerError::Unaligned`] on misaligned input, table failures as
    /// in [`Pager::map`].
    pub fn map_huge(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), PagerError> {
        if !va.is_aligned(HUGE_PAGE_SIZE) || !pa.is_aligned(u64::from(HUGE_PAGE_SIZE)) {
            return Err(PagerError::Unaligned);
        }
        let pd_phys = self.directory(va)?;
        let pd = self.provider.table_mut(pd_phys);
        // SAFETY: live table pointer from the provider.
        unsafe {
            (*pd).entries[va.pd_index()] = (pa.as_u64() & ENTRY_ADDR_MASK)
                | flags.bits()
                | (PageFlags::PRESENT | PageFlags::HUGE).bits();
        }
        self.provider.flush(va);
        Ok(())
    }

    /// Maps `size` bytes of 4 KiB pages from `va` onto `pa`.
    ///
    /// # Errors
    ///
    /// [`PagerError::Unaligned`] unless `va`, `pa` and `size` are
    /// page-aligned; table failures as in [`Pager::map`].
    pub fn map_all(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        size: u32,
        flags: PageFlags,
    ) -> Result<(), PagerError> {
        if !va.is_aligned(PAGE_SIZE) || !pa.is_aligned(u64::from(PAGE_SIZE)) || size % PAGE_SIZE != 0
        {
            return Err(PagerError::Unaligned);
        }
        let mut offset = 0u32;
        while offset < size {
            self.map(va + offset, pa + u64::from(offset), flags)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Backs `[base, limit)` with freshly allocated frames: 2 MiB pages
    /// across the aligned middle, 4 KiB pages over both residuals.
    ///
    /// Bounds must be 4 KiB-aligned. `use_all(base, base)` is a no-op.
    ///
    /// # Errors
    ///
    /// [`PagerError::Unaligned`] on misaligned bounds,
    /// [`PagerError::FrameAllocFailed`] when the frame source runs dry,
    /// table failures as in [`Pager::map`].
    pub fn use_all(
        &mut self,
        base: VirtAddr,
        limit: VirtAddr,
        flags: PageFlags,
        frames: &mut impl FrameSource,
    ) -> Result<(), PagerError> {
        if !base.is_aligned(PAGE_SIZE) || !limit.is_aligned(PAGE_SIZE) {
            return Err(PagerError::Unaligned);
        }
        let split = split_range(base.as_u32(), limit.as_u32());

        let mut va = split.low.0;
        while va < split.low.1 {
            let frame = frames.allocate_frames(0).ok_or(PagerError::FrameAllocFailed)?;
            self.map(VirtAddr::new(va), frame, flags)?;
            va += PAGE_SIZE;
        }

        let mut va = split.huge.0;
        while va < split.huge.1 {
            let frame = frames.allocate_frames(9).ok_or(PagerError::FrameAllocFailed)?;
            self.map_huge(VirtAddr::new(va), frame, flags)?;
            va += HUGE_PAGE_SIZE;
        }

        let mut va = split.high.0;
        while va < split.high.1 {
            let frame = frames.allocate_frames(0).ok_or(PagerError::FrameAllocFailed)?;
            self.map(VirtAddr::new(va), frame, flags)?;
            va += PAGE_SIZE;
        }

        Ok(())
    }

    /// Clears the mapping covering `va`. The backing frame is not
    /// freed; that remains the caller's responsibility.
    ///
    /// Returns `true` when a mapping was present.
    pub fn dispose(&mut self, va: VirtAddr) -> bool {
        let pdpt = self.provider.table_mut(self.pdpt);
        // SAFETY: live table pointer from the provider.
        let pdpte = unsafe { (*pdpt).entries[va.pdpt_index()] };
        if pdpte & PageFlags::PRESENT.bits() == 0 {
            return false;
        }
        let pd_phys = PhysAddr::new(pdpte & ENTRY_ADDR_MASK);
        let pd = self.provider.table_mut(pd_phys);
        // SAFETY: live table pointer from the provider.
        let pde = unsafe { (*pd).entries[va.pd_index()] };
        if pde & PageFlags::PRESENT.bits() == 0 {
            return false;
        }
        if pde & PageFlags::HUGE.bits() != 0 {
            // SAFETY: live table pointer from the provider.
            unsafe { (*pd).entries[va.pd_index()] = 0 };
            self.provider.flush(va);
            return true;
        }
        let pt_phys = PhysAddr::new(pde & ENTRY_ADDR_MASK);
        let pt = self.provider.table_mut(pt_phys);
        // SAFETY: live table pointer from the provider.
        let pte = unsafe { (*pt).entries[va.pt_index()] };
        if pte & PageFlags::PRESENT.bits() == 0 {
            return false;
        }
        // SAFETY: live table pointer from the provider.
        unsafe { (*pt).entries[va.pt_index()] = 0 };
        self.provider.flush(va);
        true
    }

    /// Clears every mapping in the page-aligned `[base, limit)`,
    /// stepping by whole huge pages where one is mapped.
    ///
    /// Returns the number of mappings cleared.
    pub fn dispose_all(&mut self, base: VirtAddr, limit: VirtAddr) -> usize {
        let mut cleared = 0usize;
        let mut va = base.as_u32();
        while va < limit.as_u32() {
            let step = if self
                .translate_entry(VirtAddr::new(va))
                .is_some_and(|(_, huge)| huge)
            {
                HUGE_PAGE_SIZE
            } else {
                PAGE_SIZE
            };
            if self.dispose(VirtAddr::new(va)) {
                cleared += 1;
            }
            va = match va.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        cleared
    }

    fn translate_entry(&mut self, va: VirtAddr) -> Option<(PhysAddr, bool)> {
        let pdpt = self.provider.table_mut(self.pdpt);
        // SAFETY: live table pointer from the provider.
        let pdpte = unsafe { (*pdpt).entries[va.pdpt_index()] };
        if pdpte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pd = self.provider.table_mut(PhysAddr::new(pdpte & ENTRY_ADDR_MASK));
        // SAFETY: live table pointer from the provider.
        let pde = unsafe { (*pd).entries[va.pd_index()] };
        if pde & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pde & PageFlags::HUGE.bits() != 0 {
            let huge_base = pde & ENTRY_ADDR_MASK & !u64::from(HUGE_PAGE_SIZE - 1);
            let offset = u64::from(va.as_u32() & (HUGE_PAGE_SIZE - 1));
            return Some((PhysAddr::new(huge_base + offset), true));
        }
        let pt = self.provider.table_mut(PhysAddr::new(pde & ENTRY_ADDR_MASK));
        // SAFETY: live table pointer from the provider.
        let pte = unsafe { (*pt).entries[va.pt_index()] };
        if pte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((
            PhysAddr::new((pte & ENTRY_ADDR_MASK) + u64::from(va.page_offset())),
            false,
        ))
    }

    /// Resolves `va` to its physical address, honouring huge mappings.
    pub fn translate(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate_entry(va).map(|(pa, _)| pa)
    }
}

/// Loads the context's PDPT into CR3, switching address spaces.
///
/// The caller must re-establish the recursive window for the new space
/// through its [`TableProvider`].
///
/// # Safety
///
/// `context.pdpt` must point to a valid PDPT whose kernel half maps the
/// currently executing code.
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub unsafe fn switch_space(context: &MemoryContext) {
    // SAFETY: the caller guarantees the PDPT is valid and covers the
    // running kernel image.
    unsafe {
        core::arch::asm!(
            "mov cr3, {}",
            in(reg) context.pdpt.as_u64() as u32,
            options(nostack),
        );
    }
}
