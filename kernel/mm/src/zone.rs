//! Preference-ordered physical memory zones.
//!
//! Physical RAM is partitioned into zones, each backed by its own
//! [`BuddyAllocator`] over its slice of the descriptor table. Zones of
//! equal preference form a circular ring; allocation starts at the
//! caller's preferred zone, rotates through that ring, then falls through
//! lower preference tiers down to the caller's floor. Precious tiers
//! (DMA lowest) carry low preference numbers so they are raided last.
//!
//! For every candidate zone a *state* is computed from the request size
//! against the zone's accounting, and the caller's control flags turn the
//! state into an *action*: allocate here, try the next zone, or fail.

use kaon_core::sync::{SpinLock, SpinLockGuard};

use crate::buddy::{BuddyAllocator, BuddyEntry, BuddyError};

use bitflags::bitflags;

/// Maximum number of zones a set can carry.
pub const MAX_ZONES: usize = 8;

/// Number of preference tiers.
pub const MAX_PREFERENCES: usize = 4;

bitflags! {
    /// Caller-supplied control flags for zone allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZoneControl: u32 {
        /// The caller cannot sleep; reserve memory may be dipped into.
        const ATOMIC = 1 << 0;
        /// The allocation must not fail; the emergency barrier may be
        /// crossed.
        const NO_FAILURE = 1 << 1;
        /// Only the preferred zone is acceptable; failure there is final.
        const ZONE_REQUIRED = 1 << 2;
        /// Bypass the per-CPU page cache (reserved; caches are laid out
        /// but not engaged in this revision).
        const NO_CACHE = 1 << 3;
    }
}

/// Allocability of one zone for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// General-purpose memory covers the request.
    Allocable,
    /// Covering the request dips into the reserve (atomic callers only).
    ReserveOverlap,
    /// Covering the request crosses the emergency barrier.
    BarrierOverlap,
    /// The zone cannot cover the request at all.
    LowMemory,
}

/// What to do with a zone given its state and the caller's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneAction {
    /// Allocate from this zone now.
    Allocate,
    /// Move on to the next candidate.
    GotoNext,
    /// Give up; the caller required this zone.
    RetFail,
}

/// Computes the allocation state of a zone for `required` units.
///
/// The reserve splits 7:1 — atomic callers may consume up to seven
/// eighths of it, the final eighth is the emergency barrier.
#[must_use]
pub fn zone_state(required: u64, size: u64, allocated: u64, reserved: u64) -> ZoneState {
    let mut avail = size - allocated;
    if required > avail {
        return ZoneState::LowMemory;
    }
    avail = avail.saturating_sub(reserved);
    if required <= avail {
        return ZoneState::Allocable;
    }
    avail += (7 * reserved) >> 3;
    if required <= avail {
        ZoneState::ReserveOverlap
    } else {
        ZoneState::BarrierOverlap
    }
}

/// Derives the action for a zone from its state and the caller's flags.
#[must_use]
pub fn zone_action(state: ZoneState, flags: ZoneControl) -> ZoneAction {
    let allocate = match state {
        ZoneState::Allocable => true,
        ZoneState::ReserveOverlap => {
            flags.contains(ZoneControl::ATOMIC) || flags.contains(ZoneControl::NO_FAILURE)
        }
        ZoneState::BarrierOverlap => flags.contains(ZoneControl::NO_FAILURE),
        ZoneState::LowMemory => false,
    };
    if allocate {
        ZoneAction::Allocate
    } else if flags.contains(ZoneControl::ZONE_REQUIRED) {
        ZoneAction::RetFail
    } else {
        ZoneAction::GotoNext
    }
}

/// Errors from zone allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneError {
    /// No zone in the searched tiers would take the request.
    NoZone,
    /// The chosen zone's buddy allocator failed; propagated unchanged.
    Buddy(BuddyError),
}

impl core::fmt::Display for ZoneError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoZone => write!(f, "no allocable zone"),
            Self::Buddy(e) => write!(f, "zone buddy failure: {e}"),
        }
    }
}

/// The lock-guarded interior of a zone.
#[derive(Debug)]
pub struct ZoneInner<'t, E: BuddyEntry> {
    /// The zone's buddy allocator over its descriptor slice.
    pub buddy: BuddyAllocator<'t, E>,
    /// Total units in the zone.
    pub memory_size: u64,
    /// Units held back as the atomic/emergency reserve.
    pub memory_reserved: u64,
    /// Units currently allocated out of the zone. Units never donated
    /// to the buddy count as allocated, so the state machine stays
    /// truthful while zones are still being populated.
    pub memory_allocated: u64,
}

impl<E: BuddyEntry> ZoneInner<'_, E> {
    /// Donates the free block `2^order` at the zone-local index `local`,
    /// keeping the allocation accounting in step with the buddy.
    pub fn donate(&mut self, local: u32, order: u8) {
        self.buddy.grant(local, order);
        self.memory_allocated = self
            .memory_allocated
            .checked_sub(1u64 << order)
            .expect("donated more units than the zone holds");
    }
}

/// One physical zone: accounting behind a lock, plus ring metadata.
pub struct Zone<'t, E: BuddyEntry> {
    inner: SpinLock<ZoneInner<'t, E>>,
    preference: u8,
    /// First global unit index covered by this zone.
    base_unit: u32,
    /// Units covered by this zone's descriptor slice.
    span: u32,
    /// Successor in the same-preference circular ring.
    next_in_ring: usize,
}

// SAFETY: the interior is only reached through the SpinLock.
unsafe impl<E: BuddyEntry + Send> Send for Zone<'_, E> {}
unsafe impl<E: BuddyEntry + Send> Sync for Zone<'_, E> {}

impl<'t, E: BuddyEntry> Zone<'t, E> {
    /// Builds a zone over `table`, covering global units
    /// `[base_unit, base_unit + table.len())`.
    ///
    /// Stamps every descriptor with `zone_index`; the index never changes
    /// afterwards.
    pub fn new(
        mut buddy: BuddyAllocator<'t, E>,
        zone_index: u8,
        preference: u8,
        base_unit: u32,
        reserved: u64,
    ) -> Self {
        let span = u32::try_from(buddy.capacity()).expect("zone span fits in u32");
        for i in 0..span {
            buddy.descriptor_mut(i).set_zone_index(zone_index);
        }
        let memory_size = u64::from(span);
        // Anything not yet in the buddy's free pool counts as allocated.
        let memory_allocated = memory_size - buddy.free_units();
        Self {
            inner: SpinLock::new(ZoneInner {
                buddy,
                memory_size,
                memory_reserved: reserved,
                memory_allocated,
            }),
            preference,
            base_unit,
            span,
            next_in_ring: 0,
        }
    }

    /// The zone's preference tier.
    #[must_use]
    pub fn preference(&self) -> u8 {
        self.preference
    }

    /// First global unit index covered by the zone.
    #[must_use]
    pub fn base_unit(&self) -> u32 {
        self.base_unit
    }

    /// Returns `true` when the global unit index falls inside this zone.
    #[must_use]
    pub fn covers(&self, unit: u32) -> bool {
        unit >= self.base_unit && unit - self.base_unit < self.span
    }

    /// Locks and returns the zone interior.
    pub fn lock(&self) -> SpinLockGuard<'_, ZoneInner<'t, E>> {
        self.inner.lock()
    }
}

/// A set of zones with preference rings; the allocation front end.
pub struct ZoneSet<'t, E: BuddyEntry> {
    zones: heapless::Vec<Zone<'t, E>, MAX_ZONES>,
    /// First zone of each preference tier, if the tier is populated.
    tier_heads: [Option<usize>; MAX_PREFERENCES],
}

impl<'t, E: BuddyEntry> Default for ZoneSet<'t, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'t, E: BuddyEntry> ZoneSet<'t, E> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            zones: heapless::Vec::new(),
            tier_heads: [None; MAX_PREFERENCES],
        }
    }

    /// Adds a zone. Call [`ZoneSet::link_rings`] after the last one.
    ///
    /// # Panics
    ///
    /// Panics when more than [`MAX_ZONES`] zones are added.
    pub fn push(&mut self, zone: Zone<'t, E>) -> usize {
        let index = self.zones.len();
        assert!(self.zones.push(zone).is_ok(), "too many zones");
        index
    }

    /// Builds the same-preference circular rings and tier heads.
    pub fn link_rings(&mut self) {
        for tier in 0..MAX_PREFERENCES {
            #[expect(clippy::cast_possible_truncation, reason = "tier < 4")]
            let members: heapless::Vec<usize, MAX_ZONES> = self
                .zones
                .iter()
                .enumerate()
                .filter(|(_, z)| z.preference == tier as u8)
                .map(|(i, _)| i)
                .collect();
            self.tier_heads[tier] = members.first().copied();
            for (pos, &zi) in members.iter().enumerate() {
                let next = members[(pos + 1) % members.len()];
                self.zones[zi].next_in_ring = next;
            }
        }
    }

    /// Borrows a zone by index.
    #[must_use]
    pub fn zone(&self, index: usize) -> &Zone<'t, E> {
        &self.zones[index]
    }

    /// Number of zones in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Returns `true` when the set holds no zones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Chooses a zone for a request of `required` units.
    ///
    /// Walks the preferred zone first, then its same-preference ring,
    /// then lower tiers until `floor_pref`. The first zone whose action
    /// is [`ZoneAction::Allocate`] wins and is returned locked, so the
    /// decision cannot be invalidated before the caller commits.
    ///
    /// # Errors
    ///
    /// [`ZoneError::NoZone`] when every candidate declines or a
    /// `ZONE_REQUIRED` caller's first zone refuses.
    pub fn select_zone(
        &self,
        required: u64,
        preferred: usize,
        floor_pref: u8,
        flags: ZoneControl,
    ) -> Result<(usize, SpinLockGuard<'_, ZoneInner<'t, E>>), ZoneError> {
        let mut tier = self.zones[preferred].preference;
        let mut start = preferred;

        loop {
            let mut cur = start;
            loop {
                let zone = &self.zones[cur];
                let inner = zone.inner.lock();
                let state = zone_state(
                    required,
                    inner.memory_size,
                    inner.memory_allocated,
                    inner.memory_reserved,
                );
                match zone_action(state, flags) {
                    ZoneAction::Allocate => return Ok((cur, inner)),
                    ZoneAction::RetFail => return Err(ZoneError::NoZone),
                    ZoneAction::GotoNext => {}
                }
                drop(inner);
                cur = zone.next_in_ring;
                if cur == start {
                    break;
                }
            }

            // Drop to the next populated tier, or give up at the floor.
            loop {
                if tier == floor_pref || tier == 0 {
                    return Err(ZoneError::NoZone);
                }
                tier -= 1;
                if let Some(head) = self.tier_heads[tier as usize] {
                    start = head;
                    break;
                }
            }
        }
    }

    /// Allocates a block of `2^order` units.
    ///
    /// Returns the global unit index of the block.
    ///
    /// # Errors
    ///
    /// Zone-choice failures surface as [`ZoneError::NoZone`]; buddy
    /// failures in the chosen zone propagate unchanged.
    pub fn allocate_block(
        &self,
        order: u8,
        preferred: usize,
        floor_pref: u8,
        flags: ZoneControl,
    ) -> Result<u32, ZoneError> {
        let required = 1u64 << order;
        let (zi, mut inner) = self.select_zone(required, preferred, floor_pref, flags)?;
        let local = inner.buddy.allocate(order).map_err(ZoneError::Buddy)?;
        inner.memory_allocated += required;
        debug_assert!(inner.memory_allocated <= inner.memory_size);
        Ok(self.zones[zi].base_unit + local)
    }

    /// Frees the block at the global unit index `unit`.
    ///
    /// The owning zone is found through the unit's position; the
    /// descriptor's zone index is cross-checked.
    ///
    /// # Errors
    ///
    /// Buddy consistency failures propagate unchanged.
    pub fn free_block(&self, unit: u32) -> Result<(), ZoneError> {
        let (zi, zone) = self
            .zones
            .iter()
            .enumerate()
            .find(|(_, z)| z.covers(unit))
            .expect("unit outside every zone");
        let mut inner = zone.inner.lock();
        let local = unit - zone.base_unit;
        #[expect(clippy::cast_possible_truncation, reason = "zone count <= 8")]
        {
            debug_assert_eq!(inner.buddy.descriptor(local).zone_index(), zi as u8);
        }
        let size = 1u64 << inner.buddy.descriptor(local).upper_order();
        inner.buddy.free(local).map_err(ZoneError::Buddy)?;
        inner.memory_allocated -= size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::BlockDescriptor;

    fn make_set<'t>(
        tables: &'t mut [Vec<BlockDescriptor>; 3],
        prefs: [u8; 3],
    ) -> ZoneSet<'t, BlockDescriptor> {
        let mut set = ZoneSet::new();
        let mut base = 0u32;
        let mut zi = 0u8;
        for (table, pref) in tables.iter_mut().zip(prefs) {
            let span = table.len() as u32;
            let mut buddy = BuddyAllocator::new(table.as_mut_slice(), 8);
            // Grant the whole zone in 256-unit blocks.
            for block in 0..(span >> 8) {
                buddy.grant(block << 8, 8);
            }
            let zone = Zone::new(buddy, zi, pref, base, 0);
            set.push(zone);
            base += span;
            zi += 1;
        }
        set.link_rings();
        set
    }

    #[test]
    fn state_machine_matrix() {
        // size 256, allocated 0, reserved 32.
        assert_eq!(zone_state(200, 256, 0, 32), ZoneState::Allocable);
        // 200 > 256-32 = 224? No: 200 <= 224 — allocable. Push harder:
        assert_eq!(zone_state(230, 256, 0, 32), ZoneState::ReserveOverlap);
        // Beyond 224 + 28 (7/8 of 32) = 252:
        assert_eq!(zone_state(255, 256, 0, 32), ZoneState::BarrierOverlap);
        assert_eq!(zone_state(300, 256, 0, 32), ZoneState::LowMemory);
        assert_eq!(zone_state(100, 256, 200, 0), ZoneState::LowMemory);
    }

    #[test]
    fn action_honours_flags() {
        use ZoneAction::{Allocate, GotoNext, RetFail};
        let none = ZoneControl::empty();
        assert_eq!(zone_action(ZoneState::Allocable, none), Allocate);
        assert_eq!(zone_action(ZoneState::ReserveOverlap, none), GotoNext);
        assert_eq!(
            zone_action(ZoneState::ReserveOverlap, ZoneControl::ATOMIC),
            Allocate
        );
        assert_eq!(
            zone_action(ZoneState::BarrierOverlap, ZoneControl::ATOMIC),
            GotoNext
        );
        assert_eq!(
            zone_action(ZoneState::BarrierOverlap, ZoneControl::NO_FAILURE),
            Allocate
        );
        assert_eq!(
            zone_action(ZoneState::LowMemory, ZoneControl::ZONE_REQUIRED),
            RetFail
        );
        assert_eq!(zone_action(ZoneState::LowMemory, none), GotoNext);
    }

    #[test]
    fn scenario_s2_preference_fallback() {
        let mut tables = [
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
        ];
        let set = make_set(&mut tables, [0, 1, 2]);

        // First request: 200 units, preferred zone is the preference-2
        // zone. It must be chosen directly.
        let (zi, mut inner) = set
            .select_zone(200, 2, 0, ZoneControl::empty())
            .unwrap();
        assert_eq!(zi, 2);
        inner.memory_allocated += 200;
        assert_eq!(inner.memory_allocated, 200);
        drop(inner);

        // Second identical request: preference-2's zone is low on
        // memory, so the walk falls to the preference-1 zone.
        let (zi, inner) = set
            .select_zone(200, 2, 0, ZoneControl::empty())
            .unwrap();
        assert_eq!(zi, 1);
        assert_eq!(set.zone(zi).preference(), 1);
        drop(inner);
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let mut tables = [
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
        ];
        let set = make_set(&mut tables, [0, 1, 2]);

        let unit = set
            .allocate_block(4, 2, 0, ZoneControl::empty())
            .unwrap();
        // Came from zone 2's range.
        assert!(set.zone(2).covers(unit));
        assert_eq!(set.zone(2).lock().memory_allocated, 16);

        set.free_block(unit).unwrap();
        assert_eq!(set.zone(2).lock().memory_allocated, 0);
        assert_eq!(set.zone(2).lock().buddy.free_units(), 256);
    }

    #[test]
    fn zone_required_fails_fast() {
        let mut tables = [
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
        ];
        let set = make_set(&mut tables, [0, 1, 2]);
        // Fill zone 2 completely.
        {
            let mut inner = set.zone(2).lock();
            inner.memory_allocated = inner.memory_size;
        }
        let err = set
            .select_zone(1, 2, 0, ZoneControl::ZONE_REQUIRED)
            .unwrap_err();
        assert_eq!(err, ZoneError::NoZone);
    }

    #[test]
    fn ring_rotates_within_a_tier() {
        // Two zones share preference 2; exhaust the first, expect the
        // ring to deliver the second before any tier drop.
        let mut tables = [
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
            vec![BlockDescriptor::new(); 256],
        ];
        let set = make_set(&mut tables, [0, 2, 2]);
        {
            let mut inner = set.zone(1).lock();
            inner.memory_allocated = inner.memory_size;
        }
        let (zi, _g) = set.select_zone(64, 1, 0, ZoneControl::empty()).unwrap();
        assert_eq!(zi, 2);
    }

    #[test]
    fn buddy_failure_propagates() {
        // A zone whose accounting admits the request but whose buddy is
        // fragmented must surface the buddy error unchanged.
        let mut tables = [
            vec![BlockDescriptor::new(); 4],
            vec![BlockDescriptor::new(); 4],
            vec![BlockDescriptor::new(); 4],
        ];
        let mut set = ZoneSet::new();
        let mut base = 0;
        for (zi, table) in tables.iter_mut().enumerate() {
            let mut buddy = BuddyAllocator::new(table.as_mut_slice(), 2);
            buddy.grant(0, 0);
            buddy.grant(2, 0); // two scattered units, nothing mergeable
            #[expect(clippy::cast_possible_truncation, reason = "three zones")]
            let zone = Zone::new(buddy, zi as u8, 2, base, 0);
            set.push(zone);
            base += 4;
        }
        set.link_rings();

        // Two free units satisfy the accounting, but no order-1 block
        // exists anywhere in the zone.
        let err = set
            .allocate_block(1, 0, 2, ZoneControl::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            ZoneError::Buddy(BuddyError::Fragmentation | BuddyError::MemoryLow)
        ));
    }
}
