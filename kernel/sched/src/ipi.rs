//! Per-CPU inter-processor request queues.
//!
//! Scheduler work that must run on another CPU (load transfer) is
//! enqueued on the target's message queue, then the target is kicked
//! with a hardware IPI. Messages from one sender are handled in the
//! order they were enqueued. The receiver drains its queue until empty
//! and only then acknowledges the interrupt.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use kaon_core::sync::IrqSpinLock;

use crate::roller::TaskSublist;
use crate::{CpuId, ScheduleClass};

/// A scheduler request delivered over the IPI path.
#[derive(Debug, Clone, Copy)]
pub enum SchedMessage {
    /// Splice the attached task sublist into the receiver's runqueue.
    AcceptTasks {
        /// Class whose roller receives the tasks.
        class: ScheduleClass,
        /// The tasks in flight.
        list: TaskSublist,
    },
    /// The receiver should donate load to `requester`.
    RenounceTasks {
        /// Class being balanced.
        class: ScheduleClass,
        /// The CPU asking for load.
        requester: CpuId,
        /// Domain level the imbalance was found at; scales the
        /// transfer fraction.
        level: u8,
    },
    /// A message type this kernel revision does not understand; logged
    /// and dropped by the dispatcher.
    Unknown(u32),
}

/// The hardware kick used after enqueuing: sends the scheduler IPI
/// vector to a CPU. The kernel wires this to the local APIC; tests use
/// a no-op.
pub type KickFn = fn(CpuId);

/// Routes [`SchedMessage`]s between CPUs.
pub struct IpiRouter {
    queues: Box<[IrqSpinLock<VecDeque<SchedMessage>>]>,
    kick: KickFn,
}

impl IpiRouter {
    /// Creates queues for `cpu_count` CPUs with the given kick hook.
    #[must_use]
    pub fn new(cpu_count: usize, kick: KickFn) -> Self {
        let mut queues = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            queues.push(IrqSpinLock::new(VecDeque::new()));
        }
        Self {
            queues: queues.into_boxed_slice(),
            kick,
        }
    }

    /// Enqueues `msg` for `cpu` and kicks it.
    pub fn post(&self, cpu: CpuId, msg: SchedMessage) {
        self.queues[cpu as usize].lock().push_back(msg);
        (self.kick)(cpu);
    }

    /// Drains `cpu`'s queue, invoking `handler` on each message, until
    /// the queue is observed empty. Returns the number of messages
    /// handled; the caller issues EOI afterwards.
    ///
    /// The lock is dropped around each callback so handlers may post
    /// further messages (including to this CPU).
    pub fn drain(&self, cpu: CpuId, mut handler: impl FnMut(SchedMessage)) -> usize {
        let mut handled = 0usize;
        loop {
            let next = self.queues[cpu as usize].lock().pop_front();
            match next {
                Some(msg) => {
                    handler(msg);
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    /// Messages waiting for `cpu`.
    #[must_use]
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.queues[cpu as usize].lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_kick(_cpu: CpuId) {}

    #[test]
    fn messages_arrive_in_order() {
        let router = IpiRouter::new(2, no_kick);
        router.post(1, SchedMessage::Unknown(1));
        router.post(1, SchedMessage::Unknown(2));
        router.post(1, SchedMessage::Unknown(3));

        let mut seen = Vec::new();
        let handled = router.drain(1, |msg| {
            if let SchedMessage::Unknown(code) = msg {
                seen.push(code);
            }
        });
        assert_eq!(handled, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(router.pending(1), 0);
    }

    #[test]
    fn drain_consumes_messages_posted_mid_drain() {
        let router = IpiRouter::new(1, no_kick);
        router.post(0, SchedMessage::Unknown(0));

        let mut first = true;
        let handled = router.drain(0, |_msg| {
            if first {
                first = false;
                router.post(0, SchedMessage::Unknown(7));
            }
        });
        assert_eq!(handled, 2);
    }

    #[test]
    fn queues_are_per_cpu() {
        let router = IpiRouter::new(2, no_kick);
        router.post(0, SchedMessage::Unknown(0));
        assert_eq!(router.pending(0), 1);
        assert_eq!(router.pending(1), 0);
        router.drain(1, |_| panic!("cpu 1 has no messages"));
    }
}
