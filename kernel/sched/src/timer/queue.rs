//! The event-queue front end and the hardware-timer binding.
//!
//! [`EventQueue`] is what kernel clients see: schedule a callback with a
//! tolerance window, cancel it while it is still pending, and let the
//! timer interrupt retire whatever has come due. Exactly one hardware
//! timer (PIT or HPET) carries the engine; its interrupt handler calls
//! [`retire_active_events`], which fires every live trigger of the due
//! groups and re-arms the comparator from the new leftmost group.

use alloc::vec::Vec;

use super::event::{Delay, EventCallback, Timestamp, Trigger};
use super::sorter::NodeSorter;

/// A claim ticket for a scheduled trigger; valid until the trigger's
/// group begins execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHandle {
    node: u32,
    slot: usize,
    generation: u32,
}

/// A group removed from the tree for execution.
pub struct FiredGroup {
    /// The group's execution window at removal time.
    pub range: [Timestamp; 2],
    /// All trigger slots, holes included.
    pub triggers: Vec<Trigger>,
}

/// The soft-timer event queue.
pub struct EventQueue {
    sorter: NodeSorter,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sorter: NodeSorter::new(),
        }
    }

    /// Schedules `callback(arg)` to run in `[trigger, trigger + shift]`.
    ///
    /// An existing group whose window intersects the new interval
    /// absorbs the trigger; otherwise a fresh singleton group is
    /// inserted.
    pub fn add(
        &mut self,
        trigger: Timestamp,
        shift: Delay,
        callback: EventCallback,
        arg: usize,
    ) -> TriggerHandle {
        let window = [trigger, trigger + shift];
        let record = Trigger {
            window,
            callback,
            arg,
            live: true,
        };

        if let Some(node) = self.sorter.find_for(window[0], window[1]) {
            // Narrowing the window never changes range[0]'s relative
            // order... but it can move the key. Keys may only grow
            // (the intersection starts at or after the old start), and
            // the group stays between its neighbours because the new
            // start still lies inside the old window. Re-sort anyway
            // when the key changes, to keep the tree exact.
            let old_key = self.sorter.node(node).range[0];
            let slot = self.sorter.node_mut(node).add_trigger(record);
            let generation = self.sorter.node(node).generation;
            if self.sorter.node(node).range[0] != old_key {
                self.sorter.del(node);
                self.sorter.put(node);
            }
            TriggerHandle {
                node,
                slot,
                generation,
            }
        } else {
            let node = self.sorter.alloc(record);
            let generation = self.sorter.node(node).generation;
            self.sorter.put(node);
            TriggerHandle {
                node,
                slot: 0,
                generation,
            }
        }
    }

    /// Cancels a pending trigger.
    ///
    /// Returns `false` when the handle is stale — its group already
    /// began execution (or the trigger was cancelled before).
    pub fn cancel(&mut self, handle: TriggerHandle) -> bool {
        let group = self.sorter.node(handle.node);
        if group.generation != handle.generation {
            return false;
        }
        self.sorter.node_mut(handle.node).cancel_slot(handle.slot)
    }

    /// Removes and returns the most-recent group for execution.
    pub fn pull(&mut self) -> Option<FiredGroup> {
        let node = self.sorter.most_recent()?;
        self.sorter.del(node);
        let range = self.sorter.node(node).range();
        let triggers = core::mem::take(&mut self.sorter.node_mut(node).triggers);
        self.sorter.release(node);
        Some(FiredGroup { range, triggers })
    }

    /// Start of the earliest pending group's window.
    #[must_use]
    pub fn next_start(&self) -> Option<Timestamp> {
        self.sorter
            .most_recent()
            .map(|n| self.sorter.node(n).range()[0])
    }

    /// Start of the latest pending group's window.
    #[must_use]
    pub fn last_start(&self) -> Option<Timestamp> {
        self.sorter
            .most_late()
            .map(|n| self.sorter.node(n).range()[0])
    }

    /// Number of groups pending.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.sorter.count()
    }

    /// Validates the underlying tree. Test support.
    pub fn assert_invariants(&self) {
        self.sorter.assert_invariants();
    }
}

/// The capability set a hardware timer exposes to the engine.
pub trait HardwareTimer {
    /// Reads the current counter (engine timestamps).
    fn update_counter(&mut self) -> Timestamp;

    /// Resets the counter to zero.
    fn reset_counter(&mut self);

    /// Loads the counter with `value`.
    fn set_counter(&mut self, value: Timestamp);

    /// Stops the comparator; no further interrupts fire.
    fn stop_counter(&mut self);

    /// Arms the comparator `delay` ahead of the current counter.
    fn notify_after(&mut self, delay: Delay);

    /// Arms the comparator for the absolute time `deadline`.
    fn fire_at(&mut self, deadline: Timestamp);
}

/// The timer-interrupt service path: retires every group whose window
/// has opened, then re-arms the hardware from the next pending group.
///
/// Returns the number of callbacks invoked. Cancelled triggers are
/// skipped; once a group is pulled its remaining live triggers run to
/// completion.
pub fn retire_active_events(queue: &mut EventQueue, timer: &mut impl HardwareTimer) -> usize {
    let now = timer.update_counter();
    let mut fired = 0usize;

    while queue.next_start().is_some_and(|start| start <= now) {
        let group = queue.pull().expect("next_start implies a group");
        for trigger in &group.triggers {
            if trigger.live {
                (trigger.callback)(trigger.arg);
                fired += 1;
            }
        }
    }

    match queue.next_start() {
        Some(next) => timer.fire_at(next),
        None => timer.stop_counter(),
    }

    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(arg: usize) {
        FIRED.lock().unwrap().push(arg);
    }

    fn noop(_arg: usize) {}

    #[test]
    fn scenario_s5_singletons_pull_and_absorb() {
        let mut q = EventQueue::new();
        // Shift tolerance 0: each trigger forms a singleton group.
        for t in [10u64, 20, 30, 25, 15] {
            q.add(t, 0, noop, 0);
        }
        q.assert_invariants();
        assert_eq!(q.node_count(), 5);

        // Pulling once yields the group with key 10.
        let first = q.pull().unwrap();
        assert_eq!(first.range[0], 10);
        assert_eq!(q.next_start(), Some(15));
        assert_eq!(q.node_count(), 4);

        // A tolerant trigger joins an existing overlapping group: its
        // window [17, 21] intersects the singleton at 20, so the group
        // count stays put and that group now holds two triggers.
        let before = q.node_count();
        let handle = q.add(17, 4, noop, 0);
        q.assert_invariants();
        assert_eq!(q.node_count(), before);
        let _ = handle;

        let mut starts = Vec::new();
        while let Some(g) = q.pull() {
            starts.push((g.range[0], g.triggers.iter().filter(|t| t.live).count()));
        }
        assert_eq!(starts, vec![(15, 1), (20, 2), (25, 1), (30, 1)]);
    }

    #[test]
    fn absorbing_narrows_the_group_window() {
        let mut q = EventQueue::new();
        q.add(100, 50, noop, 0); // [100, 150]
        q.add(120, 100, noop, 0); // [120, 220] -> intersection [120, 150]
        assert_eq!(q.node_count(), 1);
        assert_eq!(q.next_start(), Some(120));
        q.assert_invariants();
    }

    #[test]
    fn cancel_before_execution() {
        let mut q = EventQueue::new();
        let keep = q.add(10, 0, record, 1);
        let drop_me = q.add(10, 5, record, 2);
        assert_eq!(q.node_count(), 1);

        assert!(q.cancel(drop_me));
        assert!(!q.cancel(drop_me)); // second cancel is a no-op
        let _ = keep;

        let group = q.pull().unwrap();
        let live: Vec<usize> = group
            .triggers
            .iter()
            .filter(|t| t.live)
            .map(|t| t.arg)
            .collect();
        assert_eq!(live, vec![1]);
    }

    #[test]
    fn cancel_after_pull_is_stale() {
        let mut q = EventQueue::new();
        let h = q.add(10, 0, noop, 0);
        let _ = q.pull().unwrap();
        // Allocate a new group into the recycled slot.
        q.add(99, 0, noop, 0);
        assert!(!q.cancel(h), "stale handle must not cancel a new group");
    }

    struct MockTimer {
        now: Timestamp,
        armed: Option<Timestamp>,
        stopped: bool,
    }

    impl HardwareTimer for MockTimer {
        fn update_counter(&mut self) -> Timestamp {
            self.now
        }

        fn reset_counter(&mut self) {
            self.now = 0;
        }

        fn set_counter(&mut self, value: Timestamp) {
            self.now = value;
        }

        fn stop_counter(&mut self) {
            self.stopped = true;
            self.armed = None;
        }

        fn notify_after(&mut self, delay: Delay) {
            self.armed = Some(self.now + delay);
        }

        fn fire_at(&mut self, deadline: Timestamp) {
            self.armed = Some(deadline);
            self.stopped = false;
        }
    }

    #[test]
    fn retire_fires_due_groups_and_rearms() {
        FIRED.lock().unwrap().clear();
        let mut q = EventQueue::new();
        q.add(10, 0, record, 10);
        q.add(20, 0, record, 20);
        q.add(300, 0, record, 300);

        let mut timer = MockTimer {
            now: 25,
            armed: None,
            stopped: false,
        };
        let fired = retire_active_events(&mut q, &mut timer);
        assert_eq!(fired, 2);
        assert_eq!(*FIRED.lock().unwrap(), vec![10, 20]);
        // Re-armed for the remaining group.
        assert_eq!(timer.armed, Some(300));

        // Nothing due: the handler just re-arms.
        let fired = retire_active_events(&mut q, &mut timer);
        assert_eq!(fired, 0);
        assert_eq!(timer.armed, Some(300));

        // Final group fires; with nothing pending the timer stops.
        timer.set_counter(301);
        let fired = retire_active_events(&mut q, &mut timer);
        assert_eq!(fired, 1);
        assert!(timer.stopped);
    }

    #[test]
    fn cancelled_triggers_never_fire() {
        FIRED.lock().unwrap().clear();
        let mut q = EventQueue::new();
        q.add(5, 0, record, 1);
        let h = q.add(5, 3, record, 2);
        q.cancel(h);

        let mut timer = MockTimer {
            now: 10,
            armed: None,
            stopped: false,
        };
        let fired = retire_active_events(&mut q, &mut timer);
        assert_eq!(fired, 1);
        assert_eq!(*FIRED.lock().unwrap(), vec![1]);
    }
}
