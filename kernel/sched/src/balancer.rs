//! Topology-guided runqueue balancing.
//!
//! Each CPU periodically (and whenever it goes idle) walks upward from
//! its leaf domain looking for a sibling domain at least 20 % heavier.
//! When one is found, the busiest CPU inside it receives a renounce
//! request; the donor answers by detaching part of its ring and sending
//! it back as an accept message. The transfer fraction grows with the
//! domain level the imbalance was found at:
//! `delta = (src − dst) · (level+1) / (level+2)` — half between ring
//! siblings, two thirds one level up, and so on.

use crate::ipi::{IpiRouter, SchedMessage};
use crate::roller::{RoundRobin, ScheduleRoller};
use crate::task::TaskTable;
use crate::topology::Topology;
use crate::{CpuId, ScheduleClass};

use kaon_core::kwarn;

/// Transfer size for an imbalance of `src − dst` found at `level`.
#[must_use]
pub fn transfer_delta(src_load: i64, dst_load: i64, level: u8) -> u64 {
    let diff = src_load.saturating_sub(dst_load);
    if diff <= 0 {
        return 0;
    }
    let level = u64::from(level);
    diff.unsigned_abs() * (level + 1) / (level + 2)
}

/// One balancing pass for `cpu`: finds an over-loaded sibling domain
/// and asks its busiest CPU to renounce load.
///
/// Returns `true` when a request was issued.
pub fn balance(
    cpu: CpuId,
    class: ScheduleClass,
    topology: &Topology,
    router: &IpiRouter,
) -> bool {
    let Some(leaf) = topology.leaf_of(cpu) else {
        return false;
    };

    let mut domain = leaf;
    loop {
        if let Some(group) = topology.find_busiest_group(class, domain) {
            let Some(donor) = topology.get_busiest(class, group) else {
                return false;
            };
            let level = topology.domain(domain).level();
            router.post(
                donor,
                SchedMessage::RenounceTasks {
                    class,
                    requester: cpu,
                    level,
                },
            );
            return true;
        }
        match topology.parent_of(domain) {
            Some(parent) => domain = parent,
            None => return false,
        }
    }
}

/// Handles one scheduler IPI message on `cpu`.
///
/// Called from the IPI drain loop with the CPU's own roller.
pub fn handle_message(
    cpu: CpuId,
    msg: SchedMessage,
    tasks: &mut TaskTable,
    roller: &mut RoundRobin,
    topology: &Topology,
    router: &IpiRouter,
) {
    match msg {
        SchedMessage::RenounceTasks {
            class,
            requester,
            level,
        } => {
            let src_load = topology
                .leaf_of(cpu)
                .map_or(0, |d| topology.domain(d).load(class));
            let dst_load = topology
                .leaf_of(requester)
                .map_or(0, |d| topology.domain(d).load(class));

            let delta = transfer_delta(src_load, dst_load, level);
            if delta == 0 {
                return;
            }
            if let Some(list) = roller.send(tasks, delta) {
                let moved = i64::try_from(list.load).expect("load fits");
                topology.toggle_load(cpu, class, -moved);
                router.post(requester, SchedMessage::AcceptTasks { class, list });
            }
        }
        SchedMessage::AcceptTasks { class, list } => {
            let delta = roller.receive(tasks, list);
            topology.toggle_load(cpu, class, delta);
        }
        SchedMessage::Unknown(code) => {
            kwarn!("cpu{cpu}: dropping unknown scheduler IPI {code}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    const RR: ScheduleClass = ScheduleClass::RoundRobin;

    fn no_kick(_cpu: CpuId) {}

    /// Two sibling CPUs under one core; CPU 0 carries `a` tasks and
    /// CPU 1 carries `b`.
    fn setup(a: usize, b: usize) -> (TaskTable, [RoundRobin; 2], Topology, IpiRouter) {
        let mut tasks = TaskTable::new();
        let mut rollers = [RoundRobin::new(0), RoundRobin::new(1)];
        let topology = Topology::new();
        topology.plug(0, [0, 0, 0, 0]);
        topology.plug(1, [1, 0, 0, 0]);

        for (cpu, n) in [(0u32, a), (1u32, b)] {
            for _ in 0..n {
                let id = tasks.create(RR, cpu, 0);
                let delta = rollers[cpu as usize].add(&mut tasks, id);
                topology.toggle_load(cpu, RR, delta);
            }
        }

        let router = IpiRouter::new(2, no_kick);
        (tasks, rollers, topology, router)
    }

    #[test]
    fn transfer_delta_scales_with_level() {
        assert_eq!(transfer_delta(10, 2, 0), 4); // half
        assert_eq!(transfer_delta(10, 2, 1), 5); // two thirds of 8
        assert_eq!(transfer_delta(14, 2, 2), 9); // three quarters of 12
        assert_eq!(transfer_delta(2, 10, 0), 0); // no negative transfer
    }

    #[test]
    fn scenario_s6_balances_ten_against_two() {
        let (mut tasks, mut rollers, topology, router) = setup(10, 2);

        let parent_before = topology
            .domain(topology.parent_of(topology.leaf_of(0).unwrap()).unwrap())
            .load(RR);

        // CPU 1 runs a balancing pass: CPU 0 is 10 vs 2, well past the
        // 20 % bar, so a renounce request lands on CPU 0.
        assert!(balance(1, RR, &topology, &router));
        assert_eq!(router.pending(0), 1);

        // CPU 0 drains: computes delta = (10-2)·1/2 = 4, detaches four
        // tasks, answers with an accept.
        let [r0, r1] = &mut rollers;
        router.drain(0, |msg| {
            handle_message(0, msg, &mut tasks, r0, &topology, &router);
        });
        assert_eq!(r0.load(), 6);
        assert_eq!(
            topology.domain(topology.leaf_of(0).unwrap()).load(RR),
            6
        );
        assert_eq!(router.pending(1), 1);

        // CPU 1 drains the accept and splices the tasks in.
        router.drain(1, |msg| {
            handle_message(1, msg, &mut tasks, r1, &topology, &router);
        });
        assert_eq!(r1.load(), 6);
        assert_eq!(
            topology.domain(topology.leaf_of(1).unwrap()).load(RR),
            6
        );

        // The parent domain's load is unchanged by the move.
        let parent_after = topology
            .domain(topology.parent_of(topology.leaf_of(0).unwrap()).unwrap())
            .load(RR);
        assert_eq!(parent_before, parent_after);
        assert_eq!(parent_after, 12);
    }

    #[test]
    fn no_balance_under_twenty_percent() {
        let (_tasks, _rollers, topology, router) = setup(5, 5);
        assert!(!balance(1, RR, &topology, &router));
        assert_eq!(router.pending(0), 0);
    }

    #[test]
    fn renounce_with_no_surplus_sends_nothing() {
        let (mut tasks, mut rollers, topology, router) = setup(2, 2);
        // Force a renounce at CPU 0 even though loads are equal.
        handle_message(
            0,
            SchedMessage::RenounceTasks {
                class: RR,
                requester: 1,
                level: 0,
            },
            &mut tasks,
            &mut rollers[0],
            &topology,
            &router,
        );
        assert_eq!(router.pending(1), 0);
        assert_eq!(rollers[0].load(), 2);
    }

    #[test]
    fn unknown_message_is_dropped() {
        let (mut tasks, mut rollers, topology, router) = setup(1, 1);
        handle_message(
            0,
            SchedMessage::Unknown(99),
            &mut tasks,
            &mut rollers[0],
            &topology,
            &router,
        );
        assert_eq!(rollers[0].load(), 1);
    }
}
