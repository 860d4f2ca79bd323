//! The bring-up sequencer.
//!
//! The order is fixed and deterministic:
//!
//! 1. Parse the boot information: memory bounds, memory map, modules.
//! 2. Bring up the memory stack: frames, pager context, slab caches,
//!    heap — then the full logger.
//! 3. Parse ACPI: MADT for CPUs and IO-APICs, FADT, HPET.
//! 4. Set up the BSP: descriptor tables, local APIC, interrupt
//!    handlers, the kernel timer.
//! 5. Start every application processor through the trampoline.
//! 6. Plug every CPU into the topology and start the scheduler.
//! 7. Load the boot-module bundle, once, on the BSP.

use core::sync::atomic::{AtomicU8, Ordering};

use kaon_core::addr::{PAGE_SHIFT, PhysAddr, VirtAddr};
use kaon_core::log::LogLevel;
use kaon_core::sync::{IrqSpinLock, Once};
use kaon_core::{kfatal, kinfo, kwarn};

use kaon_acpi::{AcpiError, Fadt, HpetTable, Madt, MadtEntry, RootTable, parse_rsdp};
use kaon_mboot::BootInfo;
use kaon_mm::frame::{self, FrameManager, KernelZone, MIN_MEMORY, ZoneLayout};
use kaon_mm::kpage::KPageAllocator;
use kaon_mm::pager::{ContextFlags, MemoryContext};
use kaon_modload::{BlobRegister, ModuleLoader, ModuleRegistry, SymbolLookup};
use kaon_sched::timer::{HardwareTimer, Timestamp};

use crate::arch::x86::apic::LocalApic;
use crate::arch::x86::hpet::Hpet;
use crate::arch::x86::idt::{
    Idt, VECTOR_SCHED_IPI, VECTOR_SPURIOUS, VECTOR_TIMER, enable_interrupts,
};
use crate::arch::x86::ioapic::IoApic;
use crate::arch::x86::pit::Pit;
use crate::arch::x86::smp;
use crate::arch::x86::{gdt::Gdt, tss::Tss};
use crate::mm::{
    KernelAcpiHandler, KernelModuleSpace, layout_boot_tables, map_device, phys_to_virt,
};
use crate::processor::{MAX_CPUS, Processor, TopologyIds};

unsafe extern "C" {
    /// CR3 value of the boot page tables (linker symbol).
    static __boot_pdpt: u8;
}

// ---------------------------------------------------------------------------
// Global bring-up state
// ---------------------------------------------------------------------------

/// The mapped local-APIC register block (shared VA, per-CPU device).
static LOCAL_APIC: Once<LocalApic> = Once::new();

/// The kernel's one hardware timer.
static KERNEL_TIMER: IrqSpinLock<Option<KernelTimer>> = IrqSpinLock::new(None);

/// APIC id → logical CPU index.
static APIC_TO_CPU: [AtomicU8; 256] = [const { AtomicU8::new(0xFF) }; 256];

/// Per-CPU processor records.
static PROCESSORS: IrqSpinLock<heapless::Vec<Processor, MAX_CPUS>> =
    IrqSpinLock::new(heapless::Vec::new());

/// The global module state.
static MODULES: IrqSpinLock<Option<ModuleRegistry>> = IrqSpinLock::new(None);

/// The global symbol table.
static SYMBOLS: Once<SymbolLookup> = Once::new();

/// Runs `f` with the local APIC of the calling CPU.
pub fn with_local_apic<R>(f: impl FnOnce(&LocalApic) -> R) -> R {
    f(LOCAL_APIC.expect("local APIC not mapped"))
}

/// Runs `f` with the kernel timer.
pub fn with_kernel_timer<R>(f: impl FnOnce(&mut KernelTimer) -> R) -> R {
    let mut timer = KERNEL_TIMER.lock();
    f(timer.as_mut().expect("kernel timer not initialized"))
}

/// The logical CPU index of the calling CPU.
#[must_use]
pub fn current_cpu() -> u32 {
    let apic_id = with_local_apic(LocalApic::id);
    u32::from(APIC_TO_CPU[apic_id as usize].load(Ordering::Acquire))
}

/// Sends the scheduler IPI to a logical CPU.
pub fn send_sched_ipi(cpu: u32) {
    let apic_id = {
        let processors = PROCESSORS.lock();
        processors[cpu as usize].apic_id
    };
    with_local_apic(|apic| apic.send_ipi(apic_id, VECTOR_SCHED_IPI));
}

/// Initial count for the periodic local-APIC timer tick.
///
/// A fixed divide-by-16 count; calibration against the PM timer is a
/// TODO once frequency detection lands in `Processor::tsc_khz`.
const LAPIC_TIMER_INITIAL: u32 = 1_000_000;

/// Derives the calling CPU's topology tuple from its own CPUID leaves.
fn detect_topology(apic_id: u8) -> TopologyIds {
    TopologyIds::from_apic_id(
        apic_id,
        crate::arch::x86::cpuid::logical_per_package(),
        crate::arch::x86::cpuid::cores_per_package(),
    )
}

// ---------------------------------------------------------------------------
// The kernel timer: HPET when ACPI describes one, PIT otherwise
// ---------------------------------------------------------------------------

/// The concrete kernel timer.
pub enum KernelTimer {
    /// 8254 fallback.
    Pit(Pit),
    /// HPET comparator 0.
    Hpet(Hpet),
}

impl HardwareTimer for KernelTimer {
    fn update_counter(&mut self) -> Timestamp {
        match self {
            Self::Pit(pit) => pit.update_counter(),
            Self::Hpet(hpet) => hpet.update_counter(),
        }
    }

    fn reset_counter(&mut self) {
        match self {
            Self::Pit(pit) => pit.reset_counter(),
            Self::Hpet(hpet) => hpet.reset_counter(),
        }
    }

    fn set_counter(&mut self, value: Timestamp) {
        match self {
            Self::Pit(pit) => pit.set_counter(value),
            Self::Hpet(hpet) => hpet.set_counter(value),
        }
    }

    fn stop_counter(&mut self) {
        match self {
            Self::Pit(pit) => pit.stop_counter(),
            Self::Hpet(hpet) => hpet.stop_counter(),
        }
    }

    fn notify_after(&mut self, delay: u64) {
        match self {
            Self::Pit(pit) => pit.notify_after(delay),
            Self::Hpet(hpet) => hpet.notify_after(delay),
        }
    }

    fn fire_at(&mut self, deadline: Timestamp) {
        match self {
            Self::Pit(pit) => pit.fire_at(deadline),
            Self::Hpet(hpet) => hpet.fire_at(deadline),
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupt handlers
// ---------------------------------------------------------------------------

fn timer_handler(_vector: u8) {
    let cpu = current_cpu();
    crate::sched::on_tick(cpu, cpu == 0);
    with_local_apic(LocalApic::eoi);
}

fn sched_ipi_handler(_vector: u8) {
    crate::sched::on_sched_ipi(current_cpu());
    with_local_apic(LocalApic::eoi);
}

fn spurious_handler(_vector: u8) {
    // Spurious vectors take no EOI.
}

/// The stub every unresolved module symbol is bound to.
#[unsafe(no_mangle)]
extern "C" fn unresolved_symbol_stub() -> ! {
    panic!("call through an unresolved module symbol");
}

// ---------------------------------------------------------------------------
// Per-CPU descriptor tables (BSP statics; APs allocate from the heap)
// ---------------------------------------------------------------------------

static BSP_TSS: Tss = Tss::new(0);
static BSP_GDT: Once<Gdt> = Once::new();
static BSP_IDT: IrqSpinLock<Idt> = IrqSpinLock::new(Idt::empty());

/// Loads descriptor tables and interrupt routing on the calling CPU.
///
/// Every CPU currently shares the BSP images. TODO: give each AP its
/// own GDT/TSS pair when user tasks (and so per-CPU ring-0 stacks)
/// arrive.
fn cpu_setup_tables() {
    if !BSP_GDT.is_set() {
        #[expect(clippy::cast_possible_truncation, reason = "TSS is 104 bytes")]
        BSP_GDT.set(Gdt::new(
            core::ptr::addr_of!(BSP_TSS) as u32,
            (core::mem::size_of::<Tss>() - 1) as u32,
        ));
    }
    // SAFETY: the GDT and TSS are statics; they never move.
    unsafe {
        BSP_GDT.expect("just set").load();
        crate::arch::x86::tss::load_tr();
    }

    {
        let mut installed = BSP_IDT.lock();
        crate::irq::install_stubs(&mut installed);
    }
    crate::irq::register_handler(VECTOR_TIMER, timer_handler);
    crate::irq::register_handler(VECTOR_SCHED_IPI, sched_ipi_handler);
    crate::irq::register_handler(VECTOR_SPURIOUS, spurious_handler);
    // SAFETY: the IDT is a static and every gate points at a stub.
    unsafe {
        let idt = BSP_IDT.lock();
        let idt_ref: &'static Idt = core::mem::transmute(&*idt);
        idt_ref.load();
    }
}

// ---------------------------------------------------------------------------
// The sequencer
// ---------------------------------------------------------------------------

/// Fatal firmware anomaly: log and halt.
fn firmware_fatal(message: core::fmt::Arguments<'_>) -> ! {
    kfatal!("firmware anomaly: {message}");
    crate::halt()
}

/// Kernel entry, called from the boot stub on the BSP with paging and
/// the linear window already live.
///
/// # Safety
///
/// `mboot_phys` must point at a complete multiboot2 information block.
pub unsafe fn kernel_main(mboot_phys: u32) -> ! {
    crate::log::init_early_serial();
    kinfo!("kaon starting");

    // -- step 1: firmware memory map ------------------------------------
    let boot_virt = phys_to_virt(PhysAddr::new(u64::from(mboot_phys)));
    // SAFETY: the loader contract guarantees a complete block.
    let info = unsafe { BootInfo::from_raw(boot_virt.as_ptr()) }
        .unwrap_or_else(|e| firmware_fatal(format_args!("bad boot information: {e}")));

    if let Some(basic) = info.basic_meminfo() {
        kinfo!(
            "basic meminfo: {} KiB low, {} KiB high",
            basic.mem_lower,
            basic.mem_upper
        );
    }

    let memory_map = info
        .memory_map()
        .unwrap_or_else(|| firmware_fatal(format_args!("no memory map")));
    let total_memory = memory_map.highest_usable_end();
    if total_memory < MIN_MEMORY {
        firmware_fatal(format_args!(
            "{total_memory} bytes of memory, 128 MiB required"
        ));
    }
    kinfo!(
        "memory: {} MiB usable of {} MiB",
        memory_map.usable_bytes() >> 20,
        total_memory >> 20
    );

    // -- step 2: the memory stack ---------------------------------------
    let layout = ZoneLayout::for_total_memory(total_memory);
    // SAFETY: single-call, BSP-only, RAM behind the image per the
    // loader contract.
    let tables = unsafe { layout_boot_tables(layout.total_frames()) };
    let first_free = tables.first_free_frame;

    let manager = FrameManager::new(tables.frames, &layout);
    for region in memory_map.regions().filter(|r| r.is_usable()) {
        let mut start = region.base >> PAGE_SHIFT;
        let end = (region.base + region.length) >> PAGE_SHIFT;
        // Everything below the boot tables (kernel image included) and
        // the trampoline page stay reserved.
        start = start.max(first_free);
        if end > start {
            manager.grant_region(start, end - start);
        }
    }
    manager.set_reserve(KernelZone::Kernel, manager.free_frames() / 64);
    frame::init(manager);

    crate::mm::init_kernel_context(MemoryContext {
        pdpt: PhysAddr::new(u64::from(core::ptr::addr_of!(__boot_pdpt) as u32 - crate::mm::LINEAR_BASE)),
        flags: ContextFlags::KERNEL,
    });
    crate::mm::init_kpages(KPageAllocator::new(
        tables.kpages,
        VirtAddr::new(crate::mm::DYNAMIC_BASE),
    ));
    crate::mm::init_heap();
    // The heap's own caches exist now: switch the allocator out of its
    // boot discipline.
    crate::mm::heap().enter_normal_mode();

    crate::log::init_logger();
    crate::log::add_sink(alloc::boxed::Box::new(crate::log::SerialSink::new(
        LogLevel::Debug,
    )));
    kinfo!("memory stack up: {} frames free", frame::with(FrameManager::free_frames));

    // -- step 3: ACPI ----------------------------------------------------
    let handler = KernelAcpiHandler;
    let rsdp_bytes = info
        .rsdp()
        .unwrap_or_else(|| firmware_fatal(format_args!("no RSDP tag")));
    // The RSDP copy lives inside the boot information block.
    let rsdp_phys = u64::from(mboot_phys) + (rsdp_bytes.as_ptr() as u64 - boot_virt.as_ptr::<u8>() as u64);
    let root = parse_rsdp(&handler, rsdp_phys)
        .unwrap_or_else(|e| firmware_fatal(format_args!("RSDP: {e}")));
    let sdt = RootTable::parse(&handler, root.table_address, root.is_xsdt)
        .unwrap_or_else(|e| firmware_fatal(format_args!("root table: {e}")));

    let madt_phys = sdt
        .find(&handler, kaon_acpi::madt::MADT_SIGNATURE)
        .unwrap_or_else(|| firmware_fatal(format_args!("no MADT")));
    let madt = Madt::parse(&handler, madt_phys)
        .unwrap_or_else(|e| firmware_fatal(format_args!("MADT: {e}")));

    match sdt.find(&handler, kaon_acpi::fadt::FADT_SIGNATURE) {
        Some(fadt_phys) => match Fadt::parse(&handler, fadt_phys) {
            Ok(fadt) => kinfo!("FADT: SCI irq {}, PM timer {:#x}", fadt.sci_interrupt, fadt.pm_timer_block),
            Err(e) => firmware_fatal(format_args!("FADT: {e}")),
        },
        None => kwarn!("no FADT"),
    }

    let hpet_table = match sdt.find(&handler, kaon_acpi::hpet::HPET_SIGNATURE) {
        Some(phys) => match HpetTable::parse(&handler, phys) {
            Ok(table) => Some(table),
            Err(AcpiError::InvalidChecksum) => {
                firmware_fatal(format_args!("HPET table checksum"))
            }
            Err(e) => {
                kwarn!("HPET table: {e}");
                None
            }
        },
        None => None,
    };

    // -- step 4: BSP interrupt plumbing ---------------------------------
    let lapic_virt = map_device(PhysAddr::new(u64::from(madt.local_apic_address)), 0x1000)
        .unwrap_or_else(|| firmware_fatal(format_args!("cannot map local APIC")));
    // SAFETY: just mapped uncached.
    LOCAL_APIC.set(unsafe { LocalApic::new(lapic_virt) });

    let mut cpu_count = 0u32;
    {
        let mut processors = PROCESSORS.lock();
        for entry in madt.entries() {
            match entry {
                MadtEntry::LocalApic(lapic) if lapic.is_enabled() => {
                    let cpu = cpu_count;
                    cpu_count += 1;
                    #[expect(clippy::cast_possible_truncation, reason = "bounded by MAX_CPUS")]
                    APIC_TO_CPU[lapic.apic_id as usize].store(cpu as u8, Ordering::Release);
                    let ids = TopologyIds::from_apic_id(lapic.apic_id, 1, 1);
                    let _ = processors.push(Processor::new(cpu, lapic.apic_id, ids));
                }
                MadtEntry::IoApic(io) => {
                    if let Some(base) = map_device(PhysAddr::new(u64::from(io.address)), 0x20) {
                        // SAFETY: just mapped uncached.
                        let ioapic = unsafe { IoApic::new(base, io.gsi_base) };
                        // Preemption ticks come from the local-APIC
                        // timers; silence every legacy pin.
                        ioapic.mask_all();
                        kinfo!(
                            "ioapic {} at {:#x}: {} pins masked",
                            ioapic.id(),
                            io.address,
                            ioapic.max_entry() + 1
                        );
                    }
                }
                _ => {}
            }
        }
    }
    kinfo!("MADT: {cpu_count} cpus");

    cpu_setup_tables();
    with_local_apic(|apic| {
        apic.enable(VECTOR_SPURIOUS);
        apic.start_timer(VECTOR_TIMER, LAPIC_TIMER_INITIAL);
    });

    // One kernel timer carries the soft-timer engine; its deadlines
    // are checked from the BSP's tick.
    let timer = match hpet_table {
        Some(table) => {
            let base = map_device(PhysAddr::new(table.base_address), 0x400)
                .unwrap_or_else(|| firmware_fatal(format_args!("cannot map HPET")));
            // SAFETY: just mapped uncached, 1 KiB block.
            let hpet = unsafe { Hpet::new(base) };
            hpet.enable();
            kinfo!("kernel timer: HPET ({} fs/tick)", hpet.period_fs());
            KernelTimer::Hpet(hpet)
        }
        None => {
            // The PIT counter stays unprogrammed: the engine runs on
            // kernel ticks, and the legacy pin is masked anyway.
            kinfo!("kernel timer: PIT (tick-driven)");
            KernelTimer::Pit(Pit::new())
        }
    };
    *KERNEL_TIMER.lock() = Some(timer);

    crate::sched::init(cpu_count as usize);
    enable_interrupts();

    // -- step 5: application processors ---------------------------------
    // SAFETY: the trampoline page is reserved in the frame layout.
    unsafe { smp::install_trampoline() };
    // Copy the ids out first: an AP's entry path takes the processor
    // lock, which must not be held while waiting for it.
    let ap_ids: heapless::Vec<u8, MAX_CPUS> = {
        let processors = PROCESSORS.lock();
        processors.iter().skip(1).map(|p| p.apic_id).collect()
    };
    for apic_id in ap_ids {
        with_local_apic(|apic| smp::start_ap(apic, apic_id));
    }

    // -- step 6: topology + scheduler on the BSP ------------------------
    {
        let ids = detect_topology(with_local_apic(LocalApic::id));
        let leaf = crate::sched::plug_cpu(0, ids);
        let mut processors = PROCESSORS.lock();
        processors[0].topology = ids;
        processors[0].domain = Some(leaf);
        processors[0].brand = crate::arch::x86::cpuid::brand_string();
    }
    smp::signal_ready();

    // -- step 7: the boot-module bundle ---------------------------------
    SYMBOLS.set(SymbolLookup::new());
    load_boot_modules(&info);

    kinfo!("bring-up complete, {} cpus online", smp::cpus_ready());
    crate::sched::idle_loop(0)
}

/// AP entry, called from the trampoline once the AP is in protected
/// mode on its own stack.
pub extern "C" fn ap_main() -> ! {
    let cpu = current_cpu();
    cpu_setup_tables();
    with_local_apic(|apic| {
        apic.enable(VECTOR_SPURIOUS);
        apic.start_timer(VECTOR_TIMER, LAPIC_TIMER_INITIAL);
    });

    // Each CPU identifies itself: the subfield widths come from its
    // own CPUID leaves.
    let ids = detect_topology(with_local_apic(LocalApic::id));
    let leaf = crate::sched::plug_cpu(cpu, ids);
    {
        let mut processors = PROCESSORS.lock();
        processors[cpu as usize].topology = ids;
        processors[cpu as usize].domain = Some(leaf);
        processors[cpu as usize].brand = crate::arch::x86::cpuid::brand_string();
    }

    enable_interrupts();
    smp::signal_ready();
    crate::sched::idle_loop(cpu)
}

/// Loads the boot-module bundle delivered by the loader (step 7).
fn load_boot_modules(info: &BootInfo<'_>) {
    *MODULES.lock() = Some(ModuleRegistry::new());

    let mut blobs: alloc::vec::Vec<BlobRegister<'_>> = alloc::vec::Vec::new();
    for module in info.modules() {
        let virt = phys_to_virt(PhysAddr::new(u64::from(module.start)));
        // SAFETY: the loader placed the blob in low memory, covered by
        // the linear window, and nothing reuses it before loading (the
        // frames were kept reserved).
        let bytes =
            unsafe { core::slice::from_raw_parts(virt.as_ptr::<u8>(), module.size() as usize) };
        blobs.push(BlobRegister {
            bytes,
            load_address: u64::from(module.start),
            cmdline: module.cmdline().unwrap_or("unnamed"),
        });
    }
    if blobs.is_empty() {
        kinfo!("no boot modules");
        return;
    }

    let mut space = KernelModuleSpace;
    let mut modules = MODULES.lock();
    let registry = modules.as_mut().expect("registry just created");
    let mut loader = ModuleLoader::new(
        &mut space,
        registry,
        SYMBOLS.expect("symbol table just created"),
        unresolved_symbol_stub as usize as u32,
    );
    match loader.load_bundle(&blobs) {
        Ok(ids) => {
            for id in ids {
                let sequence = registry.get(id).init_sequence();
                kinfo!(
                    "module {}: running {} initializers",
                    registry.get(id).name,
                    sequence.len()
                );
                for functor in sequence {
                    // SAFETY: the address came out of the module's own
                    // init tables after linking; the segments are
                    // mapped executable.
                    let f: extern "C" fn() = unsafe { core::mem::transmute(functor as usize) };
                    f();
                }
            }
        }
        Err(e) => {
            // Boot-time module failure is fatal.
            kfatal!("boot module bundle failed: {e}");
            crate::halt();
        }
    }
}
