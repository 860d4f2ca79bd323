//! Per-CPU processor records and topology-id derivation.
//!
//! One [`Processor`] record exists per logical CPU, reachable by APIC
//! id. The record binds together everything the CPU owns: its hardware
//! descriptor tables, its scheduling rollers, its IPI queue slot, and
//! its leaf domain in the topology tree.
//!
//! The topology tuple is derived from the 8-bit APIC id using the
//! subfield widths CPUID reports: the SMT bits sit lowest, the core
//! bits above them, and whatever remains is the package id. x2APIC
//! (32-bit ids) is not supported in this revision.

use kaon_sched::CpuId;

/// Maximum logical CPUs supported (bounded by the 8-bit APIC id space
/// actually used and the topology arena).
pub const MAX_CPUS: usize = kaon_sched::topology::MAX_CPUS;

/// Returns the number of mask bits needed to cover `count` values —
/// `ceil(log2(count))`.
#[must_use]
pub fn mask_width(count: u32) -> u32 {
    if count <= 1 {
        return 0;
    }
    32 - (count - 1).leading_zeros()
}

/// The `(smt, core, package, cluster)` identity of one logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyIds {
    /// SMT sibling index within the core.
    pub smt: u32,
    /// Core index within the package.
    pub core: u32,
    /// Package id.
    pub package: u32,
    /// Cluster id (always 0 without x2APIC).
    pub cluster: u32,
}

impl TopologyIds {
    /// Splits an APIC id into the topology tuple.
    ///
    /// `logical_per_package` and `cores_per_package` come from CPUID
    /// leaves 1 and 4 on the CPU being identified.
    #[must_use]
    pub fn from_apic_id(apic_id: u8, logical_per_package: u32, cores_per_package: u32) -> Self {
        let core_width = mask_width(cores_per_package);
        let smt_width = mask_width(logical_per_package).saturating_sub(core_width);

        let id = u32::from(apic_id);
        let smt = id & ((1 << smt_width) - 1);
        let core = (id >> smt_width) & ((1 << core_width) - 1);
        let package = id >> (smt_width + core_width);

        Self {
            smt,
            core,
            package,
            cluster: 0,
        }
    }

    /// The tuple in the order the topology registry indexes levels:
    /// `[smt, core, package, cluster]`.
    #[must_use]
    pub fn as_levels(&self) -> [u32; 4] {
        [self.smt, self.core, self.package, self.cluster]
    }
}

/// Per-CPU kernel state.
///
/// The hardware-descriptor fields hold the virtual addresses of this
/// CPU's GDT, IDT, and TSS images; the scheduler fields are indices
/// into the shared runtime structures.
#[derive(Debug)]
pub struct Processor {
    /// Logical CPU index (0 = bootstrap processor).
    pub cpu: CpuId,
    /// This CPU's local-APIC id.
    pub apic_id: u8,
    /// Topology identity derived at plug time.
    pub topology: TopologyIds,
    /// Arena index of the CPU's leaf domain, once plugged.
    pub domain: Option<u32>,
    /// Virtual address of the CPU's GDT image.
    pub gdt: usize,
    /// Virtual address of the CPU's IDT image.
    pub idt: usize,
    /// Virtual address of the CPU's TSS image.
    pub tss: usize,
    /// Brand string reported by CPUID, truncated to fit.
    pub brand: [u8; 48],
    /// TSC frequency in kHz, measured during calibration.
    pub tsc_khz: u32,
}

impl Processor {
    /// Creates a record for a CPU that has not been plugged yet.
    #[must_use]
    pub fn new(cpu: CpuId, apic_id: u8, topology: TopologyIds) -> Self {
        Self {
            cpu,
            apic_id,
            topology,
            domain: None,
            gdt: 0,
            idt: 0,
            tss: 0,
            brand: [0; 48],
            tsc_khz: 0,
        }
    }

    /// Returns `true` once the CPU has plugged into the topology.
    #[must_use]
    pub fn is_plugged(&self) -> bool {
        self.domain.is_some()
    }
}
