//! Task records and the task arena.
//!
//! Tasks live in a slot arena and are addressed by [`TaskId`] (their
//! slot index); the run rings, sleep queues, and zombie list link tasks
//! through `next`/`prev` ids rather than pointers. Every task carries a
//! container tag recording which list currently holds it, so the
//! invariant that a task is in exactly one container at a time is
//! checked on every insert and remove.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::{CpuId, ScheduleClass, Ticks};

bitflags! {
    /// Runtime execution flags of a task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// The task may never be migrated off its CPU.
        const PINNED = 1 << 0;
        /// The task runs entirely in kernel space.
        const KERNEL_ONLY = 1 << 1;
        /// The task is the CPU's idle task.
        const IDLE = 1 << 2;
    }
}

/// Index of a task's slot in the arena.
pub type TaskId = u32;

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never dispatched.
    Start,
    /// Currently executing on its CPU.
    Execute,
    /// Ready on a run ring.
    Runnable,
    /// Sleeping; signals may wake it early.
    SleepInterruptible,
    /// Sleeping; only its deadline wakes it.
    SleepUninterruptible,
    /// Terminated, awaiting reclamation.
    Destroy,
}

/// The container currently holding a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// Not yet in any container (fresh or mid-transfer).
    None,
    /// The run ring of the given CPU.
    Runqueue(CpuId),
    /// The sleep queue of the given CPU.
    Sleeping(CpuId),
    /// The zombie list.
    Zombie,
}

/// Specialized dispatch hook; `None` means the default dispatcher
/// resumes at the saved instruction pointer.
pub type RunHook = fn(CpuId);

/// One schedulable task.
#[derive(Debug)]
pub struct Task {
    /// Successor in the current list (ring-linked).
    pub next: Option<TaskId>,
    /// Predecessor in the current list.
    pub prev: Option<TaskId>,
    /// Saved instruction pointer for the default dispatcher.
    pub saved_ip: usize,
    /// Saved stack pointer within the kernel stack.
    pub saved_sp: usize,
    /// Specialized run hook, if any.
    pub run: Option<RunHook>,
    /// Runtime flags.
    pub flags: TaskFlags,
    /// Top of the kernel stack.
    pub kernel_stack: usize,
    /// Top of the user stack (0 for pure kernel tasks).
    pub user_stack: usize,
    /// Scheduling class.
    pub class: ScheduleClass,
    /// Execution state.
    pub state: TaskState,
    /// System-wide unique id (survives slot reuse).
    pub uid: u64,
    /// CPU whose lists the task lives on.
    pub cpu: CpuId,
    /// Address-space binding (opaque context handle).
    pub context: usize,
    /// Tick at which the task was created.
    pub start_time: Ticks,
    /// Tick at which the task last ran.
    pub last_run: Ticks,
    /// Wake-up deadline while sleeping.
    pub wakeup_time: Ticks,
    /// The container currently holding the task.
    pub container: Container,
}

enum Slot {
    Free { next_free: Option<u32> },
    Used(Task),
}

/// The arena owning every task in the system.
pub struct TaskTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    next_uid: u64,
    live: usize,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            next_uid: 1,
            live: 0,
        }
    }

    /// Creates a task bound to `cpu` and returns its id.
    pub fn create(&mut self, class: ScheduleClass, cpu: CpuId, now: Ticks) -> TaskId {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.live += 1;

        let task = Task {
            next: None,
            prev: None,
            saved_ip: 0,
            saved_sp: 0,
            run: None,
            flags: TaskFlags::empty(),
            kernel_stack: 0,
            user_stack: 0,
            class,
            state: TaskState::Start,
            uid,
            cpu,
            context: 0,
            start_time: now,
            last_run: 0,
            wakeup_time: 0,
            container: Container::None,
        };

        if let Some(index) = self.free_head {
            let next_free = match &self.slots[index as usize] {
                Slot::Free { next_free } => *next_free,
                Slot::Used(_) => unreachable!("free list holds a used slot"),
            };
            self.free_head = next_free;
            self.slots[index as usize] = Slot::Used(task);
            index
        } else {
            let index = u32::try_from(self.slots.len()).expect("task table full");
            self.slots.push(Slot::Used(task));
            index
        }
    }

    /// Borrows a task.
    ///
    /// # Panics
    ///
    /// Panics on a stale or free id; task ids are kernel-internal and a
    /// dangling one is a logic error.
    #[must_use]
    pub fn get(&self, id: TaskId) -> &Task {
        match &self.slots[id as usize] {
            Slot::Used(task) => task,
            Slot::Free { .. } => panic!("dangling task id {id}"),
        }
    }

    /// Mutably borrows a task.
    ///
    /// # Panics
    ///
    /// Panics on a stale or free id.
    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        match &mut self.slots[id as usize] {
            Slot::Used(task) => task,
            Slot::Free { .. } => panic!("dangling task id {id}"),
        }
    }

    /// Releases a terminated task's slot.
    ///
    /// # Panics
    ///
    /// Panics when the task is still held by a container.
    pub fn release(&mut self, id: TaskId) {
        {
            let task = self.get(id);
            assert_eq!(
                task.container,
                Container::None,
                "releasing task {id} still in {:?}",
                task.container
            );
        }
        self.slots[id as usize] = Slot::Free {
            next_free: self.free_head,
        };
        self.free_head = Some(id);
        self.live -= 1;
    }

    /// Number of live tasks.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Moves a task into a container, asserting it was in none.
    pub(crate) fn enter_container(&mut self, id: TaskId, container: Container) {
        let task = self.get_mut(id);
        assert_eq!(
            task.container,
            Container::None,
            "task {id} already in {:?}",
            task.container
        );
        task.container = container;
    }

    /// Removes a task from its container, asserting it matches.
    pub(crate) fn leave_container(&mut self, id: TaskId, container: Container) {
        let task = self.get_mut(id);
        assert_eq!(task.container, container, "task {id} container mismatch");
        task.container = Container::None;
        task.next = None;
        task.prev = None;
    }
}
