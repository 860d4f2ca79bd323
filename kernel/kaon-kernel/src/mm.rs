//! Kernel-side memory glue: the providers that bind the `kaon-mm`
//! policy code to IA-32 paging, the global allocator, and the ACPI
//! mapping handler.
//!
//! Address-space layout (kernel half):
//!
//! - `0xC000_0000 ..` — linear window over low physical memory (the
//!   kernel image, the frame table, boot structures).
//! - `0xD000_0000 ..` — the kernel dynamic region (slabs, module
//!   segments, large heap blocks, device windows).
//! - `0xFFC0_0000` — the single-table window the page-table provider
//!   maps any paging structure through.

use core::alloc::{GlobalAlloc, Layout};

use kaon_core::addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr};
use kaon_core::sync::Once;

use kaon_mm::frame::{self, KernelZone};
use kaon_mm::heap::{Heap, LargePageSource};
use kaon_mm::kpage::{KPage, KPageAllocator};
use kaon_mm::pager::{FrameSource, MemoryContext, PageFlags, Pager, PageTable, TableProvider};
use kaon_mm::slab::{AllocatorMode, SlabSpace};
use kaon_mm::zone::ZoneControl;

/// Base of the linear physical window.
pub const LINEAR_BASE: u32 = 0xC000_0000;

/// Bytes of physical memory the linear window covers.
pub const LINEAR_SPAN: u32 = 0x3000_0000; // 768 MiB

/// Base of the kernel dynamic region.
pub const DYNAMIC_BASE: u32 = 0xD000_0000;

/// Pages in the kernel dynamic region (512 MiB).
pub const DYNAMIC_PAGES: usize = 0x2000_0000 >> 12;

/// The VA the table window maps paging structures at.
const WINDOW_VA: u32 = 0xFFC0_0000;

unsafe extern "C" {
    /// PTE slot covering [`WINDOW_VA`], wired by the boot assembly
    /// into the static kernel page tables.
    static mut __window_pte: u64;
}

/// Translates a low physical address through the linear window.
///
/// # Panics
///
/// Panics when the address lies outside the window; callers use the
/// dynamic region for anything higher.
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    let p = phys.as_u64();
    assert!(p < u64::from(LINEAR_SPAN), "physical address beyond the linear window");
    #[expect(clippy::cast_possible_truncation, reason = "bounded by the window span")]
    VirtAddr::new(LINEAR_BASE + p as u32)
}

#[inline]
fn invlpg(va: u32) {
    // SAFETY: invlpg on any address is safe in ring 0.
    unsafe { core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack)) };
}

/// The kernel's [`TableProvider`]: windows one paging structure at a
/// time through [`WINDOW_VA`].
///
/// Every `table_mut` invalidates the previous window, which is why the
/// pager re-fetches table pointers after each provider call.
pub struct KernelTableProvider;

impl TableProvider for KernelTableProvider {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        let frame = frame::frame_allocate(0, KernelZone::Kernel, ZoneControl::ATOMIC).ok()?;
        // Zero the fresh table through the window.
        let table = self.table_mut(frame);
        // SAFETY: the window maps the whole table frame.
        unsafe { (*table).entries.fill(0) };
        Some(frame)
    }

    fn table_mut(&mut self, phys: PhysAddr) -> *mut PageTable {
        // SAFETY: the window PTE is dedicated to this provider; the
        // global frame lock is not needed because paging edits are
        // serialised by the callers holding the pager path.
        unsafe {
            let pte = core::ptr::addr_of_mut!(__window_pte);
            pte.write_volatile(
                phys.as_u64() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits(),
            );
        }
        invlpg(WINDOW_VA);
        WINDOW_VA as *mut PageTable
    }

    fn flush(&self, va: VirtAddr) {
        invlpg(va.as_u32());
    }
}

/// [`FrameSource`] feeding `use_all` from the kernel zone.
pub struct KernelFrameSource {
    /// Zone the frames are drawn from.
    pub zone: KernelZone,
}

impl FrameSource for KernelFrameSource {
    fn allocate_frames(&mut self, order: u8) -> Option<PhysAddr> {
        frame::frame_allocate(order, self.zone, ZoneControl::empty()).ok()
    }
}

/// The published kernel memory context.
static KERNEL_CONTEXT: Once<MemoryContext> = Once::new();

/// The kernel dynamic-region page allocator.
static KPAGES: Once<KPageAllocator> = Once::new();

/// The kernel heap.
static HEAP: Once<Heap> = Once::new();

/// Publishes the kernel context. Bring-up only.
pub fn init_kernel_context(context: MemoryContext) {
    KERNEL_CONTEXT.set(context);
}

/// The kernel memory context.
///
/// # Panics
///
/// Panics before bring-up publishes it.
#[must_use]
pub fn kernel_context() -> &'static MemoryContext {
    KERNEL_CONTEXT.expect("kernel context not initialized")
}

/// Publishes the dynamic-region allocator. Bring-up only.
pub fn init_kpages(allocator: KPageAllocator) {
    KPAGES.set(allocator);
}

fn kpages() -> &'static KPageAllocator {
    KPAGES.expect("kernel page allocator not initialized")
}

/// Builds and publishes the heap. Bring-up step 2.
pub fn init_heap() {
    static SLAB_SPACE: KernelSlabSpace = KernelSlabSpace;
    static PAGE_SOURCE: KernelPageSource = KernelPageSource;
    HEAP.set(Heap::new(&SLAB_SPACE, &PAGE_SOURCE));
}

/// The kernel heap.
///
/// # Panics
///
/// Panics before [`init_heap`].
#[must_use]
pub fn heap() -> &'static Heap {
    HEAP.expect("heap not initialized")
}

/// Maps one fresh frame at a fresh dynamic-region page.
fn map_fresh_page(zone: KernelZone, flags: ZoneControl) -> Option<VirtAddr> {
    let va = kpages().allocate_pages(0).ok()?;
    let pa = frame::frame_allocate(0, zone, flags).ok()?;
    let mut provider = KernelTableProvider;
    let mut pager = Pager::new(&mut provider, kernel_context());
    pager.map(va, pa, PageFlags::WRITABLE).ok()?;
    // SAFETY: just mapped, writable, page-sized.
    unsafe { va.as_mut_ptr::<u8>().write_bytes(0, PAGE_SIZE as usize) };
    Some(va)
}

/// Unmaps and frees the page at `va`, returning the VA to the pool.
fn unmap_page(va: VirtAddr) {
    let mut provider = KernelTableProvider;
    let mut pager = Pager::new(&mut provider, kernel_context());
    if let Some(pa) = pager.translate(va) {
        pager.dispose(va);
        let _ = frame::frame_free(pa.align_down(u64::from(PAGE_SIZE)));
    }
    let _ = kpages().free_pages(va);
}

/// The kernel [`SlabSpace`]: dynamic-region pages backed by
/// kernel-zone frames.
pub struct KernelSlabSpace;

impl SlabSpace for KernelSlabSpace {
    fn acquire_page(&self, mode: AllocatorMode) -> Option<*mut u8> {
        let flags = match mode {
            AllocatorMode::Boot => ZoneControl::ATOMIC | ZoneControl::NO_CACHE,
            AllocatorMode::Normal => ZoneControl::empty(),
        };
        map_fresh_page(KernelZone::Kernel, flags).map(|va| va.as_mut_ptr())
    }

    fn set_page_owner(&self, page: *mut u8, owner: usize) {
        kpages().set_tag(VirtAddr::new(page as u32), owner);
    }

    fn release_page(&self, page: *mut u8) {
        unmap_page(VirtAddr::new(page as u32));
    }
}

/// The kernel [`LargePageSource`] for heap blocks beyond the largest
/// size class.
pub struct KernelPageSource;

impl LargePageSource for KernelPageSource {
    fn allocate_pages(&self, order: u8) -> Option<*mut u8> {
        let va = kpages().allocate_pages(order).ok()?;
        let mut frames = KernelFrameSource {
            zone: KernelZone::Kernel,
        };
        let mut provider = KernelTableProvider;
        let mut pager = Pager::new(&mut provider, kernel_context());
        let limit = va + ((PAGE_SIZE as u32) << order);
        pager.use_all(va, limit, PageFlags::WRITABLE, &mut frames).ok()?;
        Some(va.as_mut_ptr())
    }

    fn free_pages(&self, base: *mut u8) {
        let va = VirtAddr::new(base as u32);
        let order = kpages().order_of(va);
        let mut provider = KernelTableProvider;
        let mut pager = Pager::new(&mut provider, kernel_context());
        let limit = va + ((PAGE_SIZE as u32) << order);

        // Free every backing frame, then the translations, then the VA.
        let mut cursor = va;
        while cursor < limit {
            if let Some(pa) = pager.translate(cursor) {
                let _ = frame::frame_free(pa.align_down(u64::from(PAGE_SIZE)));
            }
            cursor = cursor + PAGE_SIZE;
        }
        pager.dispose_all(va, limit);
        let _ = kpages().free_pages(va);
    }
}

/// The kernel [`kaon_modload::ModuleSpace`]: module segments in the
/// dynamic region, backed by module-zone frames.
pub struct KernelModuleSpace;

impl kaon_modload::ModuleSpace for KernelModuleSpace {
    fn place_segments(&mut self, size: usize) -> Option<(u32, *mut u8)> {
        let pages = size.div_ceil(PAGE_SIZE as usize).next_power_of_two();
        #[expect(clippy::cast_possible_truncation, reason = "module sizes are small")]
        let order = pages.trailing_zeros() as u8;
        let va = kpages().allocate_pages(order).ok()?;
        let mut frames = KernelFrameSource {
            zone: KernelZone::Data,
        };
        let mut provider = KernelTableProvider;
        let mut pager = Pager::new(&mut provider, kernel_context());
        let limit = va + ((PAGE_SIZE as u32) << order);
        pager.use_all(va, limit, PageFlags::WRITABLE, &mut frames).ok()?;
        // SAFETY: just mapped and sized above.
        unsafe { va.as_mut_ptr::<u8>().write_bytes(0, pages * PAGE_SIZE as usize) };
        Some((va.as_u32(), va.as_mut_ptr()))
    }
}

/// Maps a device register block uncached into the dynamic region.
///
/// Returns the VA of `phys` inside the new mapping.
pub fn map_device(phys: PhysAddr, size: u32) -> Option<VirtAddr> {
    let first = phys.align_down(u64::from(PAGE_SIZE));
    let span = (phys.as_u64() - first.as_u64()) as u32 + size;
    let pages = span.div_ceil(PAGE_SIZE).next_power_of_two();
    #[expect(clippy::cast_possible_truncation, reason = "device windows are small")]
    let order = pages.trailing_zeros() as u8;

    let va = kpages().allocate_pages(order).ok()?;
    let mut provider = KernelTableProvider;
    let mut pager = Pager::new(&mut provider, kernel_context());
    let flags = PageFlags::WRITABLE | PageFlags::CACHE_DISABLE;
    let mut offset = 0u32;
    while offset < pages * PAGE_SIZE {
        pager.map(va + offset, first + u64::from(offset), flags).ok()?;
        offset += PAGE_SIZE;
    }
    #[expect(clippy::cast_possible_truncation, reason = "page offset")]
    Some(va + (phys.as_u64() - first.as_u64()) as u32)
}

/// ACPI tables are reached through the linear window (low memory) or a
/// transient device mapping.
pub struct KernelAcpiHandler;

impl kaon_acpi::AcpiHandler for KernelAcpiHandler {
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8 {
        if phys + size as u64 <= u64::from(LINEAR_SPAN) {
            return phys_to_virt(PhysAddr::new(phys)).as_ptr();
        }
        #[expect(clippy::cast_possible_truncation, reason = "table sizes are small")]
        map_device(PhysAddr::new(phys), size as u32)
            .expect("ACPI table mapping failed")
            .as_ptr()
    }
}

/// The `#[global_allocator]` front end over the kernel heap.
///
/// Alignments above the heap's natural grain are handled by
/// over-allocating and stashing the original pointer just below the
/// aligned payload.
pub struct KernelAllocator;

// SAFETY: kmalloc/kfree follow the GlobalAlloc contract: unique blocks,
// stable until freed, layout honoured via the alignment shim.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(core::mem::size_of::<u32>());
        let Some(raw) = heap().kmalloc(layout.size() + align + core::mem::size_of::<u32>(), 1)
        else {
            return core::ptr::null_mut();
        };

        let payload = (raw as usize + core::mem::size_of::<u32>()).next_multiple_of(align);
        // SAFETY: payload - 4 lies inside the allocation, after `raw`.
        unsafe {
            ((payload - core::mem::size_of::<u32>()) as *mut u32).write(raw as u32);
        }
        payload as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: alloc stashed the kmalloc pointer below the payload.
        let raw = unsafe { ptr.sub(core::mem::size_of::<u32>()).cast::<u32>().read() };
        heap().kfree(raw as *mut u8, false);
    }
}

/// Fixed descriptor-table slices carved from the linear window during
/// bring-up: the frame table directly follows the kernel image, the
/// kernel-page table follows the frame table.
pub struct BootTables {
    /// The physical frame descriptor table.
    pub frames: &'static mut [frame::Frame],
    /// The dynamic-region page descriptor table.
    pub kpages: &'static mut [KPage],
    /// First physical frame free for general use after the tables.
    pub first_free_frame: u64,
}

unsafe extern "C" {
    /// End of the kernel image (linker symbol, virtual).
    static __kernel_end: u8;
}

/// Lays the descriptor tables out after the kernel image.
///
/// # Safety
///
/// Must run once, on the BSP, before the frame allocator exists; the
/// memory after the kernel image up to the table end must be real RAM.
pub unsafe fn layout_boot_tables(total_frames: u64) -> BootTables {
    let kernel_end = core::ptr::addr_of!(__kernel_end) as u32;
    let frames_base = VirtAddr::new(kernel_end).align_up(PAGE_SIZE);

    let frames_bytes = total_frames as usize * core::mem::size_of::<frame::Frame>();
    // SAFETY: the caller guarantees RAM behind the kernel image; the
    // linear window maps it.
    let frames = unsafe {
        core::slice::from_raw_parts_mut(frames_base.as_mut_ptr::<frame::Frame>(), total_frames as usize)
    };
    for f in frames.iter_mut() {
        *f = frame::Frame::new();
    }

    let kpages_base = (frames_base + u32::try_from(frames_bytes).expect("table fits"))
        .align_up(PAGE_SIZE);
    // SAFETY: as above; the kpage table follows the frame table.
    let kpages = unsafe {
        core::slice::from_raw_parts_mut(kpages_base.as_mut_ptr::<KPage>(), DYNAMIC_PAGES)
    };
    for p in kpages.iter_mut() {
        *p = KPage::new();
    }

    let tables_end = (kpages_base
        + u32::try_from(DYNAMIC_PAGES * core::mem::size_of::<KPage>()).expect("table fits"))
    .align_up(PAGE_SIZE);
    let first_free_frame = u64::from(tables_end.as_u32() - LINEAR_BASE) >> PAGE_SHIFT;

    BootTables {
        frames,
        kpages,
        first_free_frame,
    }
}
