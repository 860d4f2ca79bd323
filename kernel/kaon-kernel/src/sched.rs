//! The scheduler runtime: the global task table, the per-CPU rollers
//! and sleep queues, the IPI routing, and the timer-tick path.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kaon_core::sync::{IrqSpinLock, Once};
use kaon_core::{kdebug, kinfo};
use kaon_sched::balancer;
use kaon_sched::ipi::IpiRouter;
use kaon_sched::roller::{RoundRobin, ScheduleRoller};
use kaon_sched::task::{TaskId, TaskState, TaskTable};
use kaon_sched::timeout::TimeoutQueue;
use kaon_sched::timer::{EventQueue, retire_active_events};
use kaon_sched::topology::Topology;
use kaon_sched::{CpuId, ScheduleClass};

use crate::processor::TopologyIds;

/// The per-CPU scheduler slice.
struct CpuSched {
    roller: IrqSpinLock<RoundRobin>,
    timeouts: IrqSpinLock<TimeoutQueue>,
}

/// The system-wide scheduler state.
pub struct SchedRuntime {
    tasks: IrqSpinLock<TaskTable>,
    cpus: Box<[CpuSched]>,
    topology: Topology,
    router: IpiRouter,
    /// The soft-timer engine, owned by the timer-interrupt CPU.
    events: IrqSpinLock<EventQueue>,
}

static RUNTIME: Once<SchedRuntime> = Once::new();

/// Sends the scheduler IPI vector to a CPU; wired to the local APIC.
fn kick(cpu: CpuId) {
    crate::boot::send_sched_ipi(cpu);
}

/// Builds the runtime for `cpu_count` CPUs. Bring-up only.
pub fn init(cpu_count: usize) {
    let mut cpus = Vec::with_capacity(cpu_count);
    for cpu in 0..cpu_count {
        #[expect(clippy::cast_possible_truncation, reason = "cpu count is small")]
        cpus.push(CpuSched {
            roller: IrqSpinLock::new(RoundRobin::new(cpu as u32)),
            timeouts: IrqSpinLock::new(TimeoutQueue::new()),
        });
    }
    RUNTIME.set(SchedRuntime {
        tasks: IrqSpinLock::new(TaskTable::new()),
        cpus: cpus.into_boxed_slice(),
        topology: Topology::new(),
        router: IpiRouter::new(cpu_count, kick),
        events: IrqSpinLock::new(EventQueue::new()),
    });
    kinfo!("scheduler runtime up for {cpu_count} cpus");
}

fn runtime() -> &'static SchedRuntime {
    RUNTIME.expect("scheduler runtime not initialized")
}

/// The topology registry.
#[must_use]
pub fn topology() -> &'static Topology {
    &runtime().topology
}

/// Plugs `cpu` into the topology and records its leaf. Idempotent.
pub fn plug_cpu(cpu: CpuId, ids: TopologyIds) -> u32 {
    let leaf = runtime().topology.plug(cpu, ids.as_levels());
    kdebug!(
        "cpu{cpu} plugged: smt={} core={} package={}",
        ids.smt,
        ids.core,
        ids.package
    );
    leaf
}

/// Creates a runnable kernel task on `cpu`.
pub fn spawn(cpu: CpuId, entry: usize, kernel_stack_top: usize) -> TaskId {
    let rt = runtime();
    let now = crate::time::now();
    let mut tasks = rt.tasks.lock();
    let id = tasks.create(ScheduleClass::RoundRobin, cpu, now);
    {
        let task = tasks.get_mut(id);
        task.saved_ip = entry;
        task.kernel_stack = kernel_stack_top;
    }
    let delta = rt.cpus[cpu as usize].roller.lock().add(&mut tasks, id);
    rt.topology.toggle_load(cpu, ScheduleClass::RoundRobin, delta);
    id
}

/// Picks the next task for `cpu`, or `None` for the idle loop.
pub fn next_task(cpu: CpuId) -> Option<TaskId> {
    let rt = runtime();
    let mut tasks = rt.tasks.lock();
    rt.cpus[cpu as usize]
        .roller
        .lock()
        .allocate(&mut tasks, crate::time::now())
}

/// Puts the running task to sleep until `wakeup` ticks.
pub fn sleep_until(cpu: CpuId, task: TaskId, wakeup: u64, interruptible: bool) {
    let rt = runtime();
    let mut tasks = rt.tasks.lock();
    let delta = rt.cpus[cpu as usize].roller.lock().free(&mut tasks, task);
    rt.topology.toggle_load(cpu, ScheduleClass::RoundRobin, delta);
    {
        let t = tasks.get_mut(task);
        t.state = if interruptible {
            TaskState::SleepInterruptible
        } else {
            TaskState::SleepUninterruptible
        };
        t.wakeup_time = wakeup;
    }
    rt.cpus[cpu as usize].timeouts.lock().insert(task, wakeup);
}

/// The timer tick on `cpu`: wake sleepers, drive preemption, retire
/// soft timers (timer-owning CPU only), and run a balance pass when
/// the runqueue went idle.
pub fn on_tick(cpu: CpuId, owns_timer: bool) {
    let rt = runtime();
    let now = crate::time::advance();

    // Expired sleepers re-enter the runqueue; preemption is checked in
    // the same critical section. Lock order everywhere in this module:
    // tasks → roller → timeouts.
    {
        let mut tasks = rt.tasks.lock();
        let mut roller = rt.cpus[cpu as usize].roller.lock();
        rt.cpus[cpu as usize].timeouts.lock().expire(now, |task| {
            let delta = roller.add(&mut tasks, task);
            rt.topology.toggle_load(cpu, ScheduleClass::RoundRobin, delta);
        });

        let _next = roller.update(&mut tasks, now);
        // The dispatcher switches on return from the interrupt when
        // `_next` names a different task; context switching itself is
        // in the interrupt-return path.
    }

    // The CPU that owns the hardware timer retires soft-timer groups.
    if owns_timer {
        crate::boot::with_kernel_timer(|timer| {
            let mut events = rt.events.lock();
            retire_active_events(&mut events, timer);
        });
    }

    // Idle CPUs pull load towards themselves.
    if rt.cpus[cpu as usize].roller.lock().count() == 0 {
        balancer::balance(cpu, ScheduleClass::RoundRobin, &rt.topology, &rt.router);
    }
}

/// The scheduler-IPI handler: drain this CPU's queue until empty, then
/// let the stub issue EOI.
pub fn on_sched_ipi(cpu: CpuId) {
    let rt = runtime();
    rt.router.drain(cpu, |msg| {
        let mut tasks = rt.tasks.lock();
        let mut roller = rt.cpus[cpu as usize].roller.lock();
        balancer::handle_message(cpu, msg, &mut tasks, &mut roller, &rt.topology, &rt.router);
    });
}

/// Schedules a soft-timer callback; see the event-queue contract.
pub fn timer_add(
    trigger: u64,
    shift: u64,
    callback: kaon_sched::timer::EventCallback,
    arg: usize,
) -> kaon_sched::timer::TriggerHandle {
    runtime().events.lock().add(trigger, shift, callback, arg)
}

/// Cancels a pending soft-timer callback.
pub fn timer_cancel(handle: kaon_sched::timer::TriggerHandle) -> bool {
    runtime().events.lock().cancel(handle)
}

/// The idle loop every CPU parks in when its runqueue is empty.
pub fn idle_loop(cpu: CpuId) -> ! {
    kinfo!("cpu{cpu} entering idle loop");
    loop {
        if next_task(cpu).is_some() {
            // The dispatcher (interrupt-return path) switches to it;
            // nothing to do here in the skeleton loop.
        }
        // SAFETY: sti;hlt parks until the next interrupt.
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
    }
}
