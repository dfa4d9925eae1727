//! The interrupt driver (C6): LAPIC + IOAPIC programming behind one
//! `InterruptDriver` vtable, with xAPIC (MMIO) and x2APIC (MSR) variants.
//!
//! Selection happens once, at [`init`]: x2APIC is preferred when CPUID
//! reports support, else xAPIC. Every operation after that dispatches
//! through [`driver`] rather than re-checking the CPUID bit, since the
//! choice cannot change at runtime.

#![no_std]

extern crate alloc;

use acpi::{get_acpi_tables, LocalApicNmiEntry};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use core_error::{CoreError, CoreResult};
use frame_allocator::FrameAllocator;
use ioapic::{IoApic, RedirectionEntry, IOAPIC_MMIO_SIZE};
use irq_safety::MutexIrqSafe;
use kernel_config::interrupts::{VECTOR_LAPIC_ERROR, VECTOR_LOCAL_TIMER, VECTOR_NMI, VECTOR_SPURIOUS};
use kernel_config::memory::{PAGE_SIZE, SHARED_MMIO_BASE};
use memory_structs::{FrameId, MapFlags, VirtualAddress};
use page_table::MemoryMap;
use raw_cpuid::CpuId;
use spin::Once;
use static_assertions::const_assert_eq;
use volatile::{ReadOnly, Volatile, WriteOnly};
use x86_64::registers::model_specific::Msr;

mod msr {
    pub const IA32_APIC_BASE: u32 = 0x1B;
    pub const IA32_X2APIC_APICID: u32 = 0x802;
    pub const IA32_X2APIC_VERSION: u32 = 0x803;
    pub const IA32_X2APIC_EOI: u32 = 0x80B;
    pub const IA32_X2APIC_LDR: u32 = 0x80D;
    pub const IA32_X2APIC_SIVR: u32 = 0x80F;
    pub const IA32_X2APIC_ESR: u32 = 0x828;
    pub const IA32_X2APIC_ICR: u32 = 0x830;
    pub const IA32_X2APIC_LVT_TIMER: u32 = 0x832;
    pub const IA32_X2APIC_INIT_COUNT: u32 = 0x838;
    pub const IA32_X2APIC_CUR_COUNT: u32 = 0x839;
    pub const IA32_X2APIC_DIV_CONF: u32 = 0x83E;
    pub const IA32_X2APIC_LVT_PMI: u32 = 0x834;
    pub const IA32_X2APIC_LVT_LINT0: u32 = 0x835;
    pub const IA32_X2APIC_LVT_LINT1: u32 = 0x836;
    pub const IA32_X2APIC_LVT_ERROR: u32 = 0x837;
    pub const IA32_X2APIC_TPR: u32 = 0x808;
}

const APIC_BASE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const APIC_BASE_BSP: u64 = 1 << 8;
const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const APIC_BASE_XAPIC_ENABLE: u64 = 1 << 11;

const APIC_SW_ENABLE: u32 = 1 << 8;
const APIC_DISABLE: u32 = 1 << 16;
const APIC_NMI_DELIVERY: u32 = 4 << 8;
const ICR_DELIVERY_STATUS: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;

/// Layout of the xAPIC's memory-mapped register window, per Intel SDM Vol
/// 3A Table 10-1. Reached through an uncached mapping in the shared MMIO
/// window, never the UEFI identity range.
#[repr(C)]
struct ApicRegisters {
    _padding0: [u32; 8],
    lapic_id: Volatile<u32>, // 0x20
    _padding1: [u32; 3],
    lapic_version: ReadOnly<u32>, // 0x30
    _padding2: [u32; 3 + 4 * 4],
    task_priority: Volatile<u32>, // 0x80
    _padding3: [u32; 3],
    arbitration_priority: ReadOnly<u32>, // 0x90
    _padding4: [u32; 3],
    processor_priority: ReadOnly<u32>, // 0xA0
    _padding5: [u32; 3],
    eoi: WriteOnly<u32>, // 0xB0
    _padding6: [u32; 3],
    remote_read: ReadOnly<u32>, // 0xC0
    _padding7: [u32; 3],
    logical_destination: Volatile<u32>, // 0xD0
    _padding8: [u32; 3],
    destination_format: Volatile<u32>, // 0xE0
    _padding9: [u32; 3],
    spurious_interrupt_vector: Volatile<u32>, // 0xF0
    _padding10: [u32; 3],
    in_service: [u32; 8 * 4], // 0x100: 8 regs, each padded to 16 bytes
    trigger_mode: [u32; 8 * 4], // 0x180
    interrupt_request: [u32; 8 * 4], // 0x200
    error_status: ReadOnly<u32>, // 0x280
    _padding11: [u32; 3 + 6 * 4],
    lvt_cmci: Volatile<u32>, // 0x2F0
    _padding12: [u32; 3],
    interrupt_command_low: Volatile<u32>, // 0x300
    _padding13: [u32; 3],
    interrupt_command_high: Volatile<u32>, // 0x310
    _padding14: [u32; 3],
    lvt_timer: Volatile<u32>, // 0x320
    _padding15: [u32; 3],
    lvt_thermal: Volatile<u32>, // 0x330
    _padding16: [u32; 3],
    lvt_perf_monitor: Volatile<u32>, // 0x340
    _padding17: [u32; 3],
    lvt_lint0: Volatile<u32>, // 0x350
    _padding18: [u32; 3],
    lvt_lint1: Volatile<u32>, // 0x360
    _padding19: [u32; 3],
    lvt_error: Volatile<u32>, // 0x370
    _padding20: [u32; 3],
    timer_initial_count: Volatile<u32>, // 0x380
    _padding21: [u32; 3],
    timer_current_count: ReadOnly<u32>, // 0x390
    _padding22: [u32; 3 + 4 * 4],
    timer_divide: Volatile<u32>, // 0x3E0
    _padding23: [u32; 3 + 1 * 4],
}
const_assert_eq!(core::mem::size_of::<ApicRegisters>(), 0x400);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptChip {
    Xapic,
    X2apic,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeliveryMode {
    Fixed,
    Nmi,
    Init,
    StartUp(u8),
}

impl DeliveryMode {
    fn bits(self) -> u32 {
        match self {
            DeliveryMode::Fixed => 0,
            DeliveryMode::Nmi => 0b100 << 8,
            DeliveryMode::Init => 0b101 << 8,
            DeliveryMode::StartUp(_) => 0b110 << 8,
        }
    }

    fn vector_override(self) -> Option<u8> {
        match self {
            DeliveryMode::StartUp(page) => Some(page),
            _ => None,
        }
    }
}

/// One external interrupt routing, translated to/from a pair of IOAPIC
/// redirection-table registers.
#[derive(Clone, Copy, Debug)]
pub struct ExternalInterruptRouting {
    pub global_number: u32,
    pub local_vector: u8,
    /// Destination LAPIC id (already resolved, not an OS-internal cpu index).
    pub target_cpu: u32,
    pub active_low: bool,
    pub level_triggered: bool,
    pub low_priority: bool,
    pub masked: bool,
}

struct LapicRegsPtr(*mut ApicRegisters);
unsafe impl Send for LapicRegsPtr {}
unsafe impl Sync for LapicRegsPtr {}

static CHIP: Once<InterruptChip> = Once::new();
static LAPIC_REGS: Once<LapicRegsPtr> = Once::new();
static IOAPICS: Once<MutexIrqSafe<Vec<IoApic>>> = Once::new();
static ERROR_LOCK: MutexIrqSafe<()> = MutexIrqSafe::new(());
static IPI_LOCK: MutexIrqSafe<()> = MutexIrqSafe::new(());
/// Dense OS-assigned id of the processor currently executing, set once
/// per core by `cpu::init` via [`set_current_cpu_index`]. Recorded only so
/// higher layers can report it; `send_ipi`'s self-target check below reads
/// the LAPIC id directly instead, since that's what the ICR destination
/// byte actually compares against.
static CURRENT_CPU_INDEX: AtomicU32 = AtomicU32::new(0);

pub fn set_current_cpu_index(index: u32) {
    CURRENT_CPU_INDEX.store(index, Ordering::Relaxed);
}

/// This core's own LAPIC id, read directly from hardware. Used by each
/// core's early bring-up code to learn its `arch_id` before
/// `cpu::init_this_cpu` has anywhere else to get it from.
pub fn current_lapic_id() -> u32 {
    match chip() {
        InterruptChip::X2apic => read_msr(msr::IA32_X2APIC_APICID) as u32,
        InterruptChip::Xapic => unsafe { (*lapic_regs()).lapic_id.read() >> 24 },
    }
}

fn has_x2apic() -> bool {
    static RESULT: Once<bool> = Once::new();
    *RESULT.call_once(|| CpuId::new().get_feature_info().map(|f| f.has_x2apic()).unwrap_or(false))
}

fn read_msr(reg: u32) -> u64 {
    unsafe { Msr::new(reg).read() }
}

unsafe fn write_msr(reg: u32, value: u64) {
    Msr::new(reg).write(value)
}

fn chip() -> InterruptChip {
    *CHIP.get().expect("apic::init was not called")
}

fn lapic_regs() -> *mut ApicRegisters {
    LAPIC_REGS.get().expect("apic::init did not run the xAPIC mapping path").0
}

/// Maps the LAPIC (xAPIC only) and every MADT IOAPIC into the shared MMIO
/// window, masks and remaps the legacy PIC if present, and brings the BSP's
/// own LAPIC to a known-good state: LINT0/LINT1 defaults overlaid with
/// MADT NMI entries, CMCI/Error/Timer LVTs pointed at reserved vectors,
/// and the spurious-interrupt vector enabling the LAPIC.
///
/// # Safety
/// Must run exactly once, on the BSP, after `acpi::init` and before any
/// other core touches the LAPIC or IOAPIC.
pub unsafe fn init(allocator: &FrameAllocator, kernel_map: &MemoryMap) -> CoreResult<()> {
    let tables = get_acpi_tables();
    let base = read_msr(msr::IA32_APIC_BASE);
    if base & APIC_BASE_BSP == 0 {
        log::warn!("apic::init invoked on a core whose BSP bit is not set");
    }

    if has_x2apic() {
        write_msr(msr::IA32_APIC_BASE, base | APIC_BASE_XAPIC_ENABLE | APIC_BASE_X2APIC_ENABLE);
        CHIP.call_once(|| InterruptChip::X2apic);
    } else {
        let phys_addr = (base & APIC_BASE_ADDR_MASK) as usize;
        let vaddr = VirtualAddress::new_canonical(SHARED_MMIO_BASE);
        let frame = FrameId::from_physical_address(phys_addr);
        kernel_map.add(allocator, vaddr, frame, MapFlags::KERNEL_ONLY | MapFlags::NO_CACHE | MapFlags::NO_EXEC, None)?;
        write_msr(msr::IA32_APIC_BASE, base | APIC_BASE_XAPIC_ENABLE);
        CHIP.call_once(|| InterruptChip::Xapic);
        LAPIC_REGS.call_once(|| LapicRegsPtr(vaddr.value() as *mut ApicRegisters));
    }

    if tables.legacy_pic_present {
        pic::disable();
    }

    program_lvts_and_lint_defaults(tables.local_apic_nmis.iter().copied(), tables.bsp_apic_id);

    let mmio_base_for_ioapics = SHARED_MMIO_BASE + PAGE_SIZE;
    let mut ioapics = Vec::with_capacity(tables.io_apics.len());
    for (i, entry) in tables.io_apics.iter().enumerate() {
        let vaddr = VirtualAddress::new_canonical(mmio_base_for_ioapics + i * IOAPIC_MMIO_SIZE);
        let frame = FrameId::from_physical_address(entry.address as usize);
        kernel_map.add(allocator, vaddr, frame, MapFlags::KERNEL_ONLY | MapFlags::NO_CACHE | MapFlags::NO_EXEC, None)?;
        ioapics.push(IoApic::new(vaddr.value(), entry.id, entry.gsi_base));
    }
    IOAPICS.call_once(|| MutexIrqSafe::new(ioapics));

    for nmi in &tables.io_apic_nmis {
        set_external_routing(ExternalInterruptRouting {
            global_number: nmi.global_system_interrupt,
            local_vector: VECTOR_NMI,
            target_cpu: tables.bsp_apic_id,
            active_low: nmi.active_low,
            level_triggered: nmi.level_triggered,
            low_priority: false,
            masked: false,
        })?;
    }

    Ok(())
}

/// Brings this core's own LAPIC (BSP or AP) up once the global init above
/// has already selected xAPIC vs x2APIC and, for xAPIC, mapped the shared
/// register window.
pub fn aux_init() {
    match chip() {
        InterruptChip::Xapic => {
            let regs = unsafe { &mut *lapic_regs() };
            regs.destination_format.write(0xFFFF_FFFF);
            regs.lvt_timer.write(APIC_DISABLE);
            regs.lvt_perf_monitor.write(APIC_NMI_DELIVERY);
            regs.lvt_lint0.write(APIC_DISABLE);
            regs.lvt_lint1.write(APIC_DISABLE);
            regs.lvt_cmci.write(APIC_DISABLE);
            regs.lvt_error.write(VECTOR_LAPIC_ERROR as u32);
            regs.task_priority.write(0);
            regs.spurious_interrupt_vector.write(VECTOR_SPURIOUS as u32 | APIC_SW_ENABLE);
        }
        InterruptChip::X2apic => unsafe {
            write_msr(msr::IA32_X2APIC_LVT_TIMER, APIC_DISABLE as u64);
            write_msr(msr::IA32_X2APIC_LVT_PMI, APIC_NMI_DELIVERY as u64);
            write_msr(msr::IA32_X2APIC_LVT_LINT0, APIC_DISABLE as u64);
            write_msr(msr::IA32_X2APIC_LVT_LINT1, APIC_DISABLE as u64);
            write_msr(msr::IA32_X2APIC_LVT_ERROR, VECTOR_LAPIC_ERROR as u64);
            write_msr(msr::IA32_X2APIC_TPR, 0);
            write_msr(msr::IA32_X2APIC_SIVR, (VECTOR_SPURIOUS as u32 | APIC_SW_ENABLE) as u64);
        },
    }
}

fn program_lvts_and_lint_defaults(nmis: impl Iterator<Item = LocalApicNmiEntry>, bsp_apic_id: u32) {
    aux_init();
    for nmi in nmis {
        let applies_to_bsp = nmi.acpi_processor_id.is_none();
        if !applies_to_bsp {
            continue; // per-CPU overlay handled by each AP's own aux_init call site
        }
        let _ = bsp_apic_id;
        set_lint(nmi.lint, nmi.active_low, nmi.level_triggered);
    }
}

fn set_lint(lint: u8, active_low: bool, level_triggered: bool) {
    let mut flags: u32 = APIC_NMI_DELIVERY;
    if active_low {
        flags |= 1 << 13;
    }
    if level_triggered {
        flags |= 1 << 15;
    }
    match chip() {
        InterruptChip::Xapic => {
            let regs = unsafe { &mut *lapic_regs() };
            match lint {
                0 => regs.lvt_lint0.write(flags),
                1 => regs.lvt_lint1.write(flags),
                _ => {}
            }
        }
        InterruptChip::X2apic => unsafe {
            match lint {
                0 => write_msr(msr::IA32_X2APIC_LVT_LINT0, flags as u64),
                1 => write_msr(msr::IA32_X2APIC_LVT_LINT1, flags as u64),
                _ => {}
            }
        },
    }
}

/// Signals end-of-interrupt to this core's own LAPIC.
pub fn signal_eoi() {
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).eoi.write(0) },
        InterruptChip::X2apic => unsafe { write_msr(msr::IA32_X2APIC_EOI, 0) },
    }
}

fn icr_destination(lapic_id: u32) -> u64 {
    if chip() == InterruptChip::X2apic {
        (lapic_id as u64) << 32
    } else {
        (lapic_id as u64) << 56
    }
}

fn write_icr(value: u64) {
    match chip() {
        InterruptChip::X2apic => unsafe { write_msr(msr::IA32_X2APIC_ICR, value) },
        InterruptChip::Xapic => {
            let regs = unsafe { &mut *lapic_regs() };
            while regs.interrupt_command_low.read() & ICR_DELIVERY_STATUS != 0 {}
            regs.interrupt_command_high.write((value >> 32) as u32);
            regs.interrupt_command_low.write(value as u32);
        }
    }
}

fn read_icr_low() -> u32 {
    match chip() {
        InterruptChip::X2apic => read_msr(msr::IA32_X2APIC_ICR) as u32,
        InterruptChip::Xapic => unsafe { (*lapic_regs()).interrupt_command_low.read() },
    }
}

/// Looks up `target_cpu`'s LAPIC id through the ACPI table's `apic_id`
/// field (never the `acpi_processor_id` field -- the two were conflated
/// at different call sites in the system this was distilled from, and
/// `apic_id` is the one that is actually wired into the ICR destination
/// byte). Interrupts are disabled locally for the duration; when
/// `wait_for_receipt` is set and the target is not this core, polls the
/// delivery-status bit until it clears.
pub fn send_ipi(target_cpu: u32, vector: u8, mode: DeliveryMode, deassert: bool, wait_for_receipt: bool) -> CoreResult<()> {
    let tables = get_acpi_tables();
    let lapic_id = tables
        .local_apics
        .get(target_cpu as usize)
        .map(|l| l.apic_id)
        .ok_or(CoreError::InvalidProcess)?;

    let _guard = IPI_LOCK.lock();
    let eff_vector = mode.vector_override().unwrap_or(vector);
    let mut icr = (eff_vector as u64) | mode.bits() as u64 | icr_destination(lapic_id);
    if !deassert {
        icr |= ICR_LEVEL_ASSERT as u64;
    }
    write_icr(icr);

    if wait_for_receipt && lapic_id != current_lapic_id() {
        let mut spins = 0u64;
        while read_icr_low() & ICR_DELIVERY_STATUS != 0 {
            spins += 1;
            if spins > 10_000_000 {
                return Err(CoreError::IpiDeliveryFailed);
            }
        }
    }
    Ok(())
}

/// Broadcasts an NMI to every core but this one, bypassing the per-target
/// LAPIC-id lookup via the ICR's `AllButMe` destination shorthand --
/// registered with `panic_core::set_halt_others` since a core mid-panic
/// cannot be assumed to still have interrupts enabled or a sane ACPI-table
/// borrow available.
pub fn broadcast_halt_ipi() {
    if CHIP.get().is_none() {
        return;
    }
    const DEST_ALL_BUT_SELF: u64 = 0b11 << 18;
    let icr = APIC_NMI_DELIVERY as u64 | DEST_ALL_BUT_SELF;
    write_icr(icr);
}

/// Selects the IOAPIC whose GSI range contains `routing.global_number`,
/// composes the redirection-table bits, and writes both halves under that
/// chip's own lock.
pub fn set_external_routing(routing: ExternalInterruptRouting) -> CoreResult<()> {
    let ioapics = IOAPICS.get().ok_or(CoreError::NoIoapic)?;
    let mut ioapics = ioapics.lock();
    let chip = ioapics
        .iter_mut()
        .find(|c| c.handles_gsi(routing.global_number))
        .ok_or(CoreError::OutOfBounds)?;
    chip.set_entry(
        routing.global_number,
        RedirectionEntry {
            vector: routing.local_vector,
            delivery_mode: if routing.low_priority { 1 } else { 0 },
            logical_destination: false,
            active_low: routing.active_low,
            level_triggered: routing.level_triggered,
            masked: routing.masked,
            destination: routing.target_cpu as u8,
        },
    )
}

pub fn get_external_routing(global_number: u32) -> CoreResult<ExternalInterruptRouting> {
    let ioapics = IOAPICS.get().ok_or(CoreError::NoIoapic)?;
    let mut ioapics = ioapics.lock();
    let chip = ioapics
        .iter_mut()
        .find(|c| c.handles_gsi(global_number))
        .ok_or(CoreError::OutOfBounds)?;
    let entry = chip.get_entry(global_number)?;
    Ok(ExternalInterruptRouting {
        global_number,
        local_vector: entry.vector,
        target_cpu: entry.destination as u32,
        active_low: entry.active_low,
        level_triggered: entry.level_triggered,
        low_priority: entry.delivery_mode == 1,
        masked: entry.masked,
    })
}

/// Reads and clears the LAPIC error-status register, under
/// local-interrupts-disabled (the SDM requires two reads to latch a fresh
/// value, so callers needing the post-clear value should call this twice).
pub fn get_error() -> u32 {
    let _guard = ERROR_LOCK.lock();
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).error_status.read() } & 0xFF,
        InterruptChip::X2apic => (read_msr(msr::IA32_X2APIC_ESR) as u32) & 0xFF,
    }
}

pub fn clear_error() {
    let _guard = ERROR_LOCK.lock();
    match chip() {
        // The xAPIC error-status register is read-only; a fresh read is
        // the closest thing this chip has to a clear.
        InterruptChip::Xapic => {
            unsafe { (*lapic_regs()).error_status.read() };
        }
        InterruptChip::X2apic => unsafe { write_msr(msr::IA32_X2APIC_ESR, 0) },
    }
}

const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const LVT_TIMER_MASKED: u32 = APIC_DISABLE;

/// Divide configuration for the LAPIC timer's input clock (the bus clock,
/// or the core crystal clock on CPUs with a TSC-deadline LAPIC timer).
/// Encodes directly to the three-bit divide-configuration register value
/// per Intel SDM Vol 3A Table 10-10 (the bit pattern is not numerically
/// sequential: divide-by-1 is `0b111`, not `0b000`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerDivide {
    By1,
    By2,
    By4,
    By8,
    By16,
    By32,
    By64,
    By128,
}

impl TimerDivide {
    fn bits(self) -> u32 {
        match self {
            TimerDivide::By2 => 0b000,
            TimerDivide::By4 => 0b001,
            TimerDivide::By8 => 0b010,
            TimerDivide::By16 => 0b011,
            TimerDivide::By32 => 0b100,
            TimerDivide::By64 => 0b101,
            TimerDivide::By128 => 0b110,
            TimerDivide::By1 => 0b111,
        }
    }
}

fn write_lvt_timer(value: u32) {
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).lvt_timer.write(value) },
        InterruptChip::X2apic => unsafe { write_msr(msr::IA32_X2APIC_LVT_TIMER, value as u64) },
    }
}

fn read_lvt_timer() -> u32 {
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).lvt_timer.read() },
        InterruptChip::X2apic => read_msr(msr::IA32_X2APIC_LVT_TIMER) as u32,
    }
}

fn write_timer_divide(divide: TimerDivide) {
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).timer_divide.write(divide.bits()) },
        InterruptChip::X2apic => unsafe { write_msr(msr::IA32_X2APIC_DIV_CONF, divide.bits() as u64) },
    }
}

fn write_timer_initial_count(count: u32) {
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).timer_initial_count.write(count) },
        InterruptChip::X2apic => unsafe { write_msr(msr::IA32_X2APIC_INIT_COUNT, count as u64) },
    }
}

/// Current value of this core's own LAPIC timer-current-count register:
/// counts down from the last initial count it was armed with, reaching
/// zero at (and staying there through, in one-shot mode) expiry.
pub fn timer_current_count() -> u32 {
    match chip() {
        InterruptChip::Xapic => unsafe { (*lapic_regs()).timer_current_count.read() },
        InterruptChip::X2apic => read_msr(msr::IA32_X2APIC_CUR_COUNT) as u32,
    }
}

/// True if this core's own LAPIC timer is currently counting down
/// (neither masked nor expired-and-idle in one-shot mode).
pub fn timer_is_running() -> bool {
    read_lvt_timer() & LVT_TIMER_MASKED == 0
}

/// Arms this core's own LAPIC timer in one-shot mode: counts down from
/// `initial_count` at the given divide, firing `vector` once it reaches
/// zero.
pub fn timer_start_one_shot(vector: u8, divide: TimerDivide, initial_count: u32) -> CoreResult<()> {
    if timer_is_running() {
        return Err(CoreError::TimerAlreadyRunning);
    }
    write_timer_divide(divide);
    write_lvt_timer(vector as u32);
    write_timer_initial_count(initial_count);
    Ok(())
}

/// As [`timer_start_one_shot`], but keeps re-arming itself from
/// `initial_count` after every expiry.
pub fn timer_start_periodic(vector: u8, divide: TimerDivide, initial_count: u32) -> CoreResult<()> {
    if timer_is_running() {
        return Err(CoreError::TimerAlreadyRunning);
    }
    write_timer_divide(divide);
    write_lvt_timer(vector as u32 | LVT_TIMER_PERIODIC);
    write_timer_initial_count(initial_count);
    Ok(())
}

/// Masks this core's own LAPIC timer and zeroes its initial count.
pub fn timer_stop() {
    write_lvt_timer(LVT_TIMER_MASKED);
    write_timer_initial_count(0);
}

/// Resolves ISA `bus`/`irq` to its global system interrupt number: applies
/// the matching MADT interrupt-source override if one exists, otherwise
/// returns `irq` unchanged. The one place this remapping happens -- every
/// caller that needs an ISA line's GSI (the legacy PIT's among them) goes
/// through this instead of re-deriving its own lookup over
/// `int_source_overrides`.
pub fn get_ext_int(bus: u8, irq: u8) -> u32 {
    let tables = get_acpi_tables();
    tables
        .int_source_overrides
        .iter()
        .find(|o| o.bus == bus && o.source_irq == irq)
        .map(|o| o.global_system_interrupt)
        .unwrap_or(irq as u32)
}
