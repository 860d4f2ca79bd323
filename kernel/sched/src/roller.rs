//! Scheduling rollers: the per-CPU, per-class runqueue engines.
//!
//! A roller owns one CPU's circular ring of runnable tasks for one
//! scheduling class. The dispatcher asks it for the next task, the
//! timer tick asks it whether the current slice has expired, and the
//! balancer detaches and splices sublists when load moves between CPUs.
//!
//! Rollers do not touch the topology tree themselves; every mutating
//! operation returns the load delta it caused so the caller can
//! propagate it up the domain hierarchy.

use crate::task::{Container, TaskFlags, TaskId, TaskState, TaskTable};
use crate::{CpuId, Ticks};

/// Ticks a task may run before the round-robin class preempts it.
pub const RR_SLICE_TICKS: Ticks = 10;

/// A detached chain of tasks in flight between CPUs.
///
/// The chain is linked through the tasks' `next` fields and terminated
/// with `None`; the tasks are in no container while in flight.
#[derive(Debug, Clone, Copy)]
pub struct TaskSublist {
    /// First task of the chain.
    pub first: TaskId,
    /// Last task of the chain.
    pub last: TaskId,
    /// Number of tasks in the chain.
    pub count: usize,
    /// Load the chain represents.
    pub load: u64,
}

/// The capability a scheduling class exposes to the dispatcher, timer
/// tick, and balancer.
pub trait ScheduleRoller {
    /// Links a task into the runqueue. Returns the load delta (+).
    fn add(&mut self, tasks: &mut TaskTable, id: TaskId) -> i64;

    /// Picks the next task to run, rotating the ring. `None` means the
    /// CPU should run its idle task.
    fn allocate(&mut self, tasks: &mut TaskTable, now: Ticks) -> Option<TaskId>;

    /// Timer tick: returns the task to switch to when the current
    /// task's slice has expired, `None` to keep running it.
    fn update(&mut self, tasks: &mut TaskTable, now: Ticks) -> Option<TaskId>;

    /// Unlinks the task that just terminated or blocked on this CPU.
    /// Returns the load delta (-).
    fn free(&mut self, tasks: &mut TaskTable, id: TaskId) -> i64;

    /// Forcibly unlinks an arbitrary task (killed or migrated away by
    /// an administrative path). Returns the load delta (-).
    fn remove(&mut self, tasks: &mut TaskTable, id: TaskId) -> i64;

    /// Detaches up to `delta_load` worth of tasks for transfer to
    /// another CPU. The current task is never detached.
    fn send(&mut self, tasks: &mut TaskTable, delta_load: u64) -> Option<TaskSublist>;

    /// Splices a delivered sublist into the runqueue. Returns the load
    /// delta (+).
    fn receive(&mut self, tasks: &mut TaskTable, list: TaskSublist) -> i64;

    /// Load currently accounted to this roller.
    fn load(&self) -> u64;

    /// Tasks currently linked in the ring.
    fn count(&self) -> usize;
}

/// The round-robin scheduling class.
pub struct RoundRobin {
    cpu: CpuId,
    /// Ring entry point (the "oldest" position).
    main: Option<TaskId>,
    /// The task most recently handed to the dispatcher.
    most_recent: Option<TaskId>,
    count: usize,
    load: u64,
}

impl RoundRobin {
    /// Creates the roller for one CPU.
    #[must_use]
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            main: None,
            most_recent: None,
            count: 0,
            load: 0,
        }
    }

    /// Links `id` at the ring tail (just before `main`).
    fn link_tail(&mut self, tasks: &mut TaskTable, id: TaskId) {
        match self.main {
            None => {
                let task = tasks.get_mut(id);
                task.next = Some(id);
                task.prev = Some(id);
                self.main = Some(id);
            }
            Some(main) => {
                let tail = tasks.get(main).prev.expect("ring is fully linked");
                tasks.get_mut(id).next = Some(main);
                tasks.get_mut(id).prev = Some(tail);
                tasks.get_mut(tail).next = Some(id);
                tasks.get_mut(main).prev = Some(id);
            }
        }
    }

    /// Unlinks `id` from the ring, fixing the cursors.
    fn unlink(&mut self, tasks: &mut TaskTable, id: TaskId) {
        let (next, prev) = {
            let task = tasks.get(id);
            (
                task.next.expect("task not ring-linked"),
                task.prev.expect("task not ring-linked"),
            )
        };

        if next == id {
            // Last task in the ring.
            self.main = None;
            self.most_recent = None;
        } else {
            tasks.get_mut(prev).next = Some(next);
            tasks.get_mut(next).prev = Some(prev);
            if self.main == Some(id) {
                self.main = Some(next);
            }
            if self.most_recent == Some(id) {
                // Step back so the next allocate lands on `next`.
                self.most_recent = Some(prev);
            }
        }
    }
}

impl ScheduleRoller for RoundRobin {
    fn add(&mut self, tasks: &mut TaskTable, id: TaskId) -> i64 {
        tasks.enter_container(id, Container::Runqueue(self.cpu));
        {
            let task = tasks.get_mut(id);
            task.cpu = self.cpu;
            task.state = TaskState::Runnable;
        }
        self.link_tail(tasks, id);
        self.count += 1;
        self.load += 1;
        1
    }

    fn allocate(&mut self, tasks: &mut TaskTable, now: Ticks) -> Option<TaskId> {
        let next = match self.most_recent {
            Some(recent) => tasks.get(recent).next.expect("ring is fully linked"),
            None => self.main?,
        };
        self.most_recent = Some(next);
        let task = tasks.get_mut(next);
        task.state = TaskState::Execute;
        task.last_run = now;
        Some(next)
    }

    fn update(&mut self, tasks: &mut TaskTable, now: Ticks) -> Option<TaskId> {
        let current = self.most_recent?;
        if self.count <= 1 {
            return None;
        }
        let started = tasks.get(current).last_run;
        if now.saturating_sub(started) < RR_SLICE_TICKS {
            return None;
        }
        // Slice expired: the current task becomes runnable again and
        // the successor takes over.
        tasks.get_mut(current).state = TaskState::Runnable;
        self.allocate(tasks, now)
    }

    fn free(&mut self, tasks: &mut TaskTable, id: TaskId) -> i64 {
        self.unlink(tasks, id);
        tasks.leave_container(id, Container::Runqueue(self.cpu));
        self.count -= 1;
        self.load -= 1;
        -1
    }

    fn remove(&mut self, tasks: &mut TaskTable, id: TaskId) -> i64 {
        // Same unlink mechanics as `free`; kept separate because the
        // target need not be the task the dispatcher last handed out,
        // and callers treat the two as distinct capabilities.
        self.free(tasks, id)
    }

    fn send(&mut self, tasks: &mut TaskTable, delta_load: u64) -> Option<TaskSublist> {
        if delta_load == 0 {
            return None;
        }

        let mut first: Option<TaskId> = None;
        let mut last: Option<TaskId> = None;
        let mut moved = 0u64;
        let mut skipped = 0usize;

        while moved < delta_load && self.count > 0 {
            // Take from the ring entry point, skipping the task the
            // dispatcher is currently running and any pinned task.
            let candidate = self.main.expect("count > 0 means a ring exists");
            if Some(candidate) == self.most_recent
                || tasks.get(candidate).flags.contains(TaskFlags::PINNED)
            {
                skipped += 1;
                if skipped >= self.count {
                    break;
                }
                self.main = tasks.get(candidate).next;
                continue;
            }
            skipped = 0;

            self.unlink(tasks, candidate);
            tasks.leave_container(candidate, Container::Runqueue(self.cpu));
            self.count -= 1;
            self.load -= 1;

            // Chain the detached task.
            tasks.get_mut(candidate).next = None;
            match last {
                None => first = Some(candidate),
                Some(prev) => tasks.get_mut(prev).next = Some(candidate),
            }
            tasks.get_mut(candidate).prev = last;
            last = Some(candidate);
            moved += 1;
        }

        let first = first?;
        Some(TaskSublist {
            first,
            last: last.expect("chain has a tail when it has a head"),
            count: usize::try_from(moved).expect("chain length fits"),
            load: moved,
        })
    }

    fn receive(&mut self, tasks: &mut TaskTable, list: TaskSublist) -> i64 {
        let mut cursor = Some(list.first);
        let mut spliced = 0usize;
        while let Some(id) = cursor {
            cursor = tasks.get(id).next;
            // Clear the chain links before ring insertion.
            {
                let task = tasks.get_mut(id);
                task.next = None;
                task.prev = None;
            }
            self.add(tasks, id);
            // `add` already counted the task; undo the double count of
            // load bookkeeping below by tracking splices.
            spliced += 1;
        }
        debug_assert_eq!(spliced, list.count);
        i64::try_from(list.load).expect("load delta fits")
    }

    fn load(&self) -> u64 {
        self.load
    }

    fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScheduleClass;

    fn setup(n: usize) -> (TaskTable, RoundRobin, Vec<TaskId>) {
        let mut tasks = TaskTable::new();
        let mut rr = RoundRobin::new(0);
        let ids: Vec<TaskId> = (0..n)
            .map(|_| {
                let id = tasks.create(ScheduleClass::RoundRobin, 0, 0);
                rr.add(&mut tasks, id);
                id
            })
            .collect();
        (tasks, rr, ids)
    }

    #[test]
    fn allocate_rotates_in_insertion_order() {
        let (mut tasks, mut rr, ids) = setup(3);
        let order: Vec<TaskId> = (0..6).map(|t| rr.allocate(&mut tasks, t).unwrap()).collect();
        assert_eq!(order[..3], ids[..]);
        assert_eq!(order[3..], ids[..]); // wraps around
    }

    #[test]
    fn empty_roller_yields_idle() {
        let mut tasks = TaskTable::new();
        let mut rr = RoundRobin::new(0);
        assert!(rr.allocate(&mut tasks, 0).is_none());
        assert!(rr.update(&mut tasks, 100).is_none());
    }

    #[test]
    fn update_preempts_only_after_slice() {
        let (mut tasks, mut rr, ids) = setup(2);
        let first = rr.allocate(&mut tasks, 0).unwrap();
        assert_eq!(first, ids[0]);

        // Mid-slice: no preemption.
        assert!(rr.update(&mut tasks, RR_SLICE_TICKS - 1).is_none());
        // Slice expired: the successor takes over.
        let next = rr.update(&mut tasks, RR_SLICE_TICKS).unwrap();
        assert_eq!(next, ids[1]);
        assert_eq!(tasks.get(ids[0]).state, TaskState::Runnable);
        assert_eq!(tasks.get(ids[1]).state, TaskState::Execute);
    }

    #[test]
    fn single_task_is_never_preempted() {
        let (mut tasks, mut rr, _ids) = setup(1);
        rr.allocate(&mut tasks, 0).unwrap();
        assert!(rr.update(&mut tasks, 1000).is_none());
    }

    #[test]
    fn free_unlinks_and_adjusts_load() {
        let (mut tasks, mut rr, ids) = setup(3);
        assert_eq!(rr.load(), 3);
        let delta = rr.free(&mut tasks, ids[1]);
        assert_eq!(delta, -1);
        assert_eq!(rr.count(), 2);

        // Rotation skips the removed task.
        let seen: Vec<TaskId> = (0..4).map(|t| rr.allocate(&mut tasks, t).unwrap()).collect();
        assert!(!seen.contains(&ids[1]));
    }

    #[test]
    fn free_last_task_empties_the_ring() {
        let (mut tasks, mut rr, ids) = setup(1);
        rr.free(&mut tasks, ids[0]);
        assert_eq!(rr.count(), 0);
        assert!(rr.allocate(&mut tasks, 0).is_none());
    }

    #[test]
    fn remove_targets_any_ring_member() {
        let (mut tasks, mut rr, ids) = setup(4);
        rr.allocate(&mut tasks, 0).unwrap(); // ids[0] running
        let delta = rr.remove(&mut tasks, ids[2]);
        assert_eq!(delta, -1);
        assert_eq!(rr.count(), 3);
        assert_eq!(tasks.get(ids[2]).container, Container::None);
    }

    #[test]
    fn send_detaches_requested_load() {
        let (mut tasks, mut rr, _ids) = setup(6);
        let list = rr.send(&mut tasks, 4).unwrap();
        assert_eq!(list.count, 4);
        assert_eq!(list.load, 4);
        assert_eq!(rr.count(), 2);
        assert_eq!(rr.load(), 2);

        // The chain is well-formed and its tasks are container-free.
        let mut cursor = Some(list.first);
        let mut walked = 0;
        while let Some(id) = cursor {
            assert_eq!(tasks.get(id).container, Container::None);
            cursor = tasks.get(id).next;
            walked += 1;
        }
        assert_eq!(walked, 4);
    }

    #[test]
    fn send_never_detaches_the_running_task() {
        let (mut tasks, mut rr, _ids) = setup(3);
        let running = rr.allocate(&mut tasks, 0).unwrap();
        let list = rr.send(&mut tasks, 10).unwrap();
        assert_eq!(list.count, 2); // everything except the running task
        assert_eq!(rr.count(), 1);
        let mut cursor = Some(list.first);
        while let Some(id) = cursor {
            assert_ne!(id, running);
            cursor = tasks.get(id).next;
        }
    }

    #[test]
    fn receive_splices_and_rebinds_cpu() {
        let (mut tasks, mut donor, _ids) = setup(5);
        let list = donor.send(&mut tasks, 3).unwrap();

        let mut acceptor = RoundRobin::new(1);
        let delta = acceptor.receive(&mut tasks, list);
        assert_eq!(delta, 3);
        assert_eq!(acceptor.count(), 3);
        assert_eq!(acceptor.load(), 3);

        // Every spliced task now belongs to CPU 1's runqueue.
        for _ in 0..3 {
            let id = acceptor.allocate(&mut tasks, 0).unwrap();
            assert_eq!(tasks.get(id).cpu, 1);
            assert_eq!(tasks.get(id).container, Container::Runqueue(1));
        }
    }

    #[test]
    fn send_on_empty_roller_is_none() {
        let mut tasks = TaskTable::new();
        let mut rr = RoundRobin::new(0);
        assert!(rr.send(&mut tasks, 4).is_none());
    }
}
