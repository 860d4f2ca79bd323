//! The kernel frame manager: physical zone layout and the global
//! allocate/free entry points.
//!
//! Physical RAM is carved into five zones — DMA, Driver, Code, Data,
//! Kernel — sized from the firmware-reported total. DMA sits in
//! preference tier 0 (raided last), Driver in tier 1, and the three
//! kernel tiers share a preference-2 ring. One [`Frame`] descriptor per
//! physical page lives in a table built during bring-up; the table is
//! split into per-zone slices, each run by its own buddy allocator.

use kaon_core::addr::PhysAddr;
use kaon_core::sync::{Once, SpinLock};

use crate::buddy::{BlockTag, BuddyAllocator, BuddyEntry};
use crate::zone::{Zone, ZoneControl, ZoneError, ZoneSet};
use crate::{FRAME_SHIFT, MAX_FRAME_ORDER};

/// One physical page-frame descriptor.
///
/// Currently just the buddy header; the layout leaves room for per-CPU
/// cache links in a later revision.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Frame {
    desc: crate::buddy::BlockDescriptor,
}

impl Frame {
    /// Creates a zeroed frame descriptor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            desc: crate::buddy::BlockDescriptor::new(),
        }
    }
}

impl BuddyEntry for Frame {
    fn desc(&self) -> &crate::buddy::BlockDescriptor {
        &self.desc
    }

    fn desc_mut(&mut self) -> &mut crate::buddy::BlockDescriptor {
        &mut self.desc
    }
}

/// The five kernel frame zones, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum KernelZone {
    /// ISA DMA window (first 16 MiB).
    Dma = 0,
    /// Device/driver memory above the DMA window.
    Driver = 1,
    /// Kernel code frames.
    Code = 2,
    /// Kernel data frames.
    Data = 3,
    /// General kernel frames (slabs, tables, stacks).
    Kernel = 4,
}

impl KernelZone {
    /// The zone's preference tier: precious tiers get low numbers so the
    /// allocator falls back towards them only when pressed.
    #[must_use]
    pub fn preference(self) -> u8 {
        match self {
            Self::Dma => 0,
            Self::Driver => 1,
            Self::Code | Self::Data | Self::Kernel => 2,
        }
    }
}

/// Frames in 16 MiB.
const DMA_FRAMES: u64 = (16 * 1024 * 1024) >> FRAME_SHIFT;

/// Frames in 896 MiB (DMA + Driver cap on large machines).
const LOW_CAP_FRAMES: u64 = (896 * 1024 * 1024) >> FRAME_SHIFT;

/// Byte threshold between the two sizing rules (3.5 GiB).
const SPLIT_THRESHOLD: u64 = 3584 * 1024 * 1024;

/// Minimum supported physical memory (128 MiB).
pub const MIN_MEMORY: u64 = 128 * 1024 * 1024;

/// Per-zone frame spans, derived from total memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneLayout {
    /// Frame counts indexed by [`KernelZone`].
    pub spans: [u64; 5],
}

impl ZoneLayout {
    /// Computes the zone layout for `total_bytes` of physical memory.
    ///
    /// Below 3.5 GiB the space splits into four equal chunks with DMA
    /// and Driver sharing the first; at or above it, DMA + Driver are
    /// capped at 896 MiB and the remainder splits three ways.
    ///
    /// # Panics
    ///
    /// Panics below [`MIN_MEMORY`]; the caller is expected to have
    /// halted on that firmware anomaly already.
    #[must_use]
    pub fn for_total_memory(total_bytes: u64) -> Self {
        assert!(total_bytes >= MIN_MEMORY, "machine below minimum memory");
        let total_frames = total_bytes >> FRAME_SHIFT;

        let mut spans = [0u64; 5];
        if total_bytes < SPLIT_THRESHOLD {
            let chunk = total_frames / 4;
            spans[KernelZone::Dma as usize] = DMA_FRAMES.min(chunk);
            spans[KernelZone::Driver as usize] = chunk - spans[KernelZone::Dma as usize];
            spans[KernelZone::Code as usize] = chunk;
            spans[KernelZone::Data as usize] = chunk;
            spans[KernelZone::Kernel as usize] = total_frames - 3 * chunk;
        } else {
            spans[KernelZone::Dma as usize] = DMA_FRAMES;
            spans[KernelZone::Driver as usize] = LOW_CAP_FRAMES - DMA_FRAMES;
            let remaining = total_frames - LOW_CAP_FRAMES;
            let chunk = remaining / 3;
            spans[KernelZone::Code as usize] = chunk;
            spans[KernelZone::Data as usize] = chunk;
            spans[KernelZone::Kernel as usize] = remaining - 2 * chunk;
        }
        Self { spans }
    }

    /// Total frames across all zones.
    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.spans.iter().sum()
    }

    /// First frame number of the given zone.
    #[must_use]
    pub fn zone_base(&self, zone: KernelZone) -> u64 {
        self.spans[..zone as usize].iter().sum()
    }
}

/// The frame manager: the zone set over the frame table.
pub struct FrameManager {
    set: ZoneSet<'static, Frame>,
}

impl FrameManager {
    /// Builds the manager over the frame table.
    ///
    /// `table` must cover `layout.total_frames()` entries and live for
    /// the kernel's lifetime. Every frame starts reserved; usable
    /// regions are donated afterwards with
    /// [`FrameManager::grant_region`].
    ///
    /// # Panics
    ///
    /// Panics when the table length disagrees with the layout.
    pub fn new(mut table: &'static mut [Frame], layout: &ZoneLayout) -> Self {
        assert_eq!(
            table.len() as u64,
            layout.total_frames(),
            "frame table does not match the zone layout"
        );

        let mut set = ZoneSet::new();
        let mut base_unit: u32 = 0;
        for zone_index in 0..5usize {
            let span = layout.spans[zone_index];
            // Take the table out of the binding so the split keeps the
            // 'static lifetime.
            let (slice, rest) =
                core::mem::take(&mut table).split_at_mut(usize::try_from(span).expect("span fits"));
            table = rest;

            let buddy = BuddyAllocator::new(slice, MAX_FRAME_ORDER);
            // Reserves are configured after donation, once the zone's
            // real free pool is known.
            #[expect(clippy::cast_possible_truncation, reason = "five zones")]
            let zone = Zone::new(
                buddy,
                zone_index as u8,
                kernel_zone(zone_index).preference(),
                base_unit,
                0,
            );
            set.push(zone);
            base_unit += u32::try_from(span).expect("span fits in u32");
        }
        set.link_rings();
        Self { set }
    }

    /// Donates the usable frame range `[first, first + count)` to its
    /// zones.
    ///
    /// The range may straddle zone boundaries; each part is granted in
    /// maximal naturally-aligned power-of-two blocks.
    pub fn grant_region(&self, first: u64, count: u64) {
        let end = first + count;
        for zi in 0..self.set.len() {
            let zone = self.set.zone(zi);
            let zone_base = u64::from(zone.base_unit());
            let mut inner = zone.lock();
            let zone_end = zone_base + inner.memory_size;

            let lo = first.max(zone_base);
            let hi = end.min(zone_end);
            let mut f = lo;
            while f < hi {
                let local = u32::try_from(f - zone_base).expect("frame index fits");
                // Largest block both aligned at `local` and fitting.
                let align_order = if local == 0 {
                    MAX_FRAME_ORDER
                } else {
                    #[expect(clippy::cast_possible_truncation, reason = "orders are small")]
                    let t = local.trailing_zeros() as u8;
                    t.min(MAX_FRAME_ORDER)
                };
                #[expect(clippy::cast_possible_truncation, reason = "orders are small")]
                let fit_order = (63 - (hi - f).leading_zeros() as u8).min(MAX_FRAME_ORDER);
                let order = align_order.min(fit_order);
                inner.donate(local, order);
                f += 1u64 << order;
            }
        }
    }

    /// Configures a zone's atomic/emergency reserve.
    ///
    /// Called once after donation; the reserve must not exceed the
    /// zone's free pool.
    pub fn set_reserve(&self, zone: KernelZone, frames: u64) {
        let mut inner = self.set.zone(zone as usize).lock();
        debug_assert!(frames <= inner.buddy.free_units());
        inner.memory_reserved = frames;
    }

    /// Allocates `2^order` frames, preferring `zone`.
    ///
    /// # Errors
    ///
    /// Zone and buddy failures propagate as [`ZoneError`].
    pub fn allocate(
        &self,
        order: u8,
        zone: KernelZone,
        flags: ZoneControl,
    ) -> Result<PhysAddr, ZoneError> {
        let floor = if flags.contains(ZoneControl::ZONE_REQUIRED) {
            zone.preference()
        } else {
            0
        };
        let unit = self.set.allocate_block(order, zone as usize, floor, flags)?;
        Ok(PhysAddr::new(u64::from(unit) << FRAME_SHIFT))
    }

    /// Frees the block of frames starting at `addr`.
    ///
    /// # Errors
    ///
    /// Buddy consistency failures propagate; they are fatal for the
    /// caller.
    pub fn free(&self, addr: PhysAddr) -> Result<(), ZoneError> {
        let unit = u32::try_from(addr.frame_number()).expect("frame number fits");
        self.set.free_block(unit)
    }

    /// Tags the block starting at `addr` with a consumer classification.
    pub fn tag(&self, addr: PhysAddr, tag: BlockTag) {
        let unit = u32::try_from(addr.frame_number()).expect("frame number fits");
        for zi in 0..self.set.len() {
            let zone = self.set.zone(zi);
            if zone.covers(unit) {
                let local = unit - zone.base_unit();
                zone.lock().buddy.descriptor_mut(local).set_tag(tag);
                return;
            }
        }
    }

    /// Sum of free frames over all zones.
    #[must_use]
    pub fn free_frames(&self) -> u64 {
        (0..self.set.len())
            .map(|zi| self.set.zone(zi).lock().buddy.free_units())
            .sum()
    }
}

fn kernel_zone(index: usize) -> KernelZone {
    match index {
        0 => KernelZone::Dma,
        1 => KernelZone::Driver,
        2 => KernelZone::Code,
        3 => KernelZone::Data,
        _ => KernelZone::Kernel,
    }
}

/// The global frame manager, published once by the bring-up sequencer.
static FRAME_MANAGER: Once<FrameManager> = Once::new();

/// The global frame lock; taken before any per-zone lock.
static FRAME_LOCK: SpinLock<()> = SpinLock::new(());

/// Publishes the frame manager. Bring-up only.
pub fn init(manager: FrameManager) {
    FRAME_MANAGER.set(manager);
}

/// Allocates `2^order` frames from the global manager.
///
/// # Errors
///
/// Propagates [`ZoneError`] from the zone stack.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn frame_allocate(
    order: u8,
    zone: KernelZone,
    flags: ZoneControl,
) -> Result<PhysAddr, ZoneError> {
    let _global = FRAME_LOCK.lock();
    FRAME_MANAGER
        .expect("frame manager not initialized")
        .allocate(order, zone, flags)
}

/// Frees frames previously handed out by [`frame_allocate`].
///
/// # Errors
///
/// Propagates [`ZoneError`] from the zone stack.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn frame_free(addr: PhysAddr) -> Result<(), ZoneError> {
    let _global = FRAME_LOCK.lock();
    FRAME_MANAGER
        .expect("frame manager not initialized")
        .free(addr)
}

/// Runs `f` against the global frame manager.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn with<R>(f: impl FnOnce(&FrameManager) -> R) -> R {
    let _global = FRAME_LOCK.lock();
    f(FRAME_MANAGER.expect("frame manager not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    fn leaked_table(frames: u64) -> &'static mut [Frame] {
        Box::leak(vec![Frame::new(); usize::try_from(frames).unwrap()].into_boxed_slice())
    }

    #[test]
    fn layout_small_machine_quarters() {
        // 1 GiB: four chunks of 64 Ki frames.
        let layout = ZoneLayout::for_total_memory(GIB);
        let chunk = (GIB >> FRAME_SHIFT) / 4;
        assert_eq!(layout.spans[KernelZone::Dma as usize], DMA_FRAMES);
        assert_eq!(
            layout.spans[KernelZone::Driver as usize],
            chunk - DMA_FRAMES
        );
        assert_eq!(layout.spans[KernelZone::Code as usize], chunk);
        assert_eq!(layout.spans[KernelZone::Data as usize], chunk);
        assert_eq!(layout.spans[KernelZone::Kernel as usize], chunk);
        assert_eq!(layout.total_frames(), GIB >> FRAME_SHIFT);
    }

    #[test]
    fn layout_large_machine_caps_low_zones() {
        // 4 GiB: DMA + Driver capped at 896 MiB.
        let layout = ZoneLayout::for_total_memory(4 * GIB);
        assert_eq!(layout.spans[KernelZone::Dma as usize], DMA_FRAMES);
        assert_eq!(
            layout.spans[KernelZone::Dma as usize] + layout.spans[KernelZone::Driver as usize],
            (896 * MIB) >> FRAME_SHIFT
        );
        let remaining = (4 * GIB - 896 * MIB) >> FRAME_SHIFT;
        assert_eq!(layout.spans[KernelZone::Code as usize], remaining / 3);
        assert_eq!(layout.total_frames(), (4 * GIB) >> FRAME_SHIFT);
    }

    #[test]
    fn layout_zone_bases_accumulate() {
        let layout = ZoneLayout::for_total_memory(GIB);
        assert_eq!(layout.zone_base(KernelZone::Dma), 0);
        assert_eq!(layout.zone_base(KernelZone::Driver), DMA_FRAMES);
        assert_eq!(
            layout.zone_base(KernelZone::Code),
            (GIB >> FRAME_SHIFT) / 4
        );
    }

    #[test]
    #[should_panic(expected = "below minimum memory")]
    fn layout_rejects_tiny_machines() {
        let _ = ZoneLayout::for_total_memory(64 * MIB);
    }

    #[test]
    fn grant_allocate_free_roundtrip() {
        let layout = ZoneLayout::for_total_memory(MIN_MEMORY);
        let manager = FrameManager::new(leaked_table(layout.total_frames()), &layout);

        // Donate the whole kernel zone.
        let kernel_base = layout.zone_base(KernelZone::Kernel);
        let kernel_span = layout.spans[KernelZone::Kernel as usize];
        manager.grant_region(kernel_base, kernel_span);
        assert_eq!(manager.free_frames(), kernel_span);

        let addr = manager
            .allocate(0, KernelZone::Kernel, ZoneControl::empty())
            .unwrap();
        assert!(addr.frame_number() >= kernel_base);
        assert_eq!(manager.free_frames(), kernel_span - 1);

        manager.free(addr).unwrap();
        assert_eq!(manager.free_frames(), kernel_span);
    }

    #[test]
    fn allocation_falls_back_across_zones() {
        let layout = ZoneLayout::for_total_memory(MIN_MEMORY);
        let manager = FrameManager::new(leaked_table(layout.total_frames()), &layout);

        // Only the driver zone has memory; a kernel-zone request must
        // fall through the empty preference-2 ring into tier 1.
        let driver_base = layout.zone_base(KernelZone::Driver);
        manager.grant_region(driver_base, 64);

        let addr = manager
            .allocate(0, KernelZone::Kernel, ZoneControl::empty())
            .unwrap();
        assert!(addr.frame_number() >= driver_base);
        assert!(addr.frame_number() < driver_base + 64);
    }

    #[test]
    fn zone_required_does_not_fall_back() {
        let layout = ZoneLayout::for_total_memory(MIN_MEMORY);
        let manager = FrameManager::new(leaked_table(layout.total_frames()), &layout);
        manager.grant_region(layout.zone_base(KernelZone::Driver), 64);

        let err = manager
            .allocate(0, KernelZone::Kernel, ZoneControl::ZONE_REQUIRED)
            .unwrap_err();
        assert!(matches!(err, ZoneError::NoZone | ZoneError::Buddy(_)));
    }

    #[test]
    fn grant_region_straddles_zone_boundary() {
        let layout = ZoneLayout::for_total_memory(MIN_MEMORY);
        let manager = FrameManager::new(leaked_table(layout.total_frames()), &layout);

        // 32 frames on each side of the Code/Data boundary.
        let boundary = layout.zone_base(KernelZone::Data);
        manager.grant_region(boundary - 32, 64);
        assert_eq!(manager.free_frames(), 64);

        // Both halves are allocatable from their own zones.
        let code = manager
            .allocate(0, KernelZone::Code, ZoneControl::ZONE_REQUIRED)
            .unwrap();
        assert!(code.frame_number() < boundary);
        let data = manager
            .allocate(0, KernelZone::Data, ZoneControl::ZONE_REQUIRED)
            .unwrap();
        assert!(data.frame_number() >= boundary);
    }
}
