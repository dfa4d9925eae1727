//! HPET driver (part of C9): maps the High Precision Event Timer's MMIO
//! register block and exposes the main counter plus up to 32 comparators.
//!
//! This crate only ever touches registers; it has no opinion on which GSI
//! a comparator's interrupt should land on -- the timer manager owns that
//! decision (typically legacy-replacement routing, which rewires
//! comparator 0 onto the PIT's historic GSI0 wire and comparator 1 onto
//! the RTC's GSI8 wire without any IOAPIC redirection-table entry).

#![no_std]

use acpi::hpet_table::HpetDescriptor;
use core::sync::atomic::{AtomicBool, Ordering};
use core_error::{CoreError, CoreResult};
use frame_allocator::FrameAllocator;
use kernel_config::memory::SHARED_MMIO_BASE;
use memory_structs::{FrameId, MapFlags, VirtualAddress};
use page_table::MemoryMap;
use spin::Once;
use static_assertions::const_assert_eq;
use volatile::{ReadOnly, Volatile};

/// Offset, within the shared MMIO window, of the HPET's register block.
/// Chosen well clear of the LAPIC (one page) and IOAPIC (one page each,
/// rarely more than a handful) windows `apic::init` maps at the front of
/// the same window.
const HPET_MMIO_OFFSET: usize = 0x10_0000;

const MAX_COMPARATORS: usize = 32;

const GENERAL_CONFIG_ENABLE: u64 = 1 << 0;
const GENERAL_CONFIG_LEGACY_REPLACEMENT: u64 = 1 << 1;

const COMPARATOR_INT_TYPE_LEVEL: u64 = 1 << 1;
const COMPARATOR_INT_ENABLE: u64 = 1 << 2;
const COMPARATOR_TYPE_PERIODIC: u64 = 1 << 3;
const COMPARATOR_PERIODIC_CAPABLE: u64 = 1 << 4;
const COMPARATOR_VALUE_SET: u64 = 1 << 6;

#[repr(C)]
struct ComparatorRegisters {
    configuration_and_capability: Volatile<u64>,
    comparator_value: Volatile<u64>,
    fsb_interrupt_route: Volatile<u64>,
    _padding: u64,
}
const_assert_eq!(core::mem::size_of::<ComparatorRegisters>(), 0x20);

#[repr(C)]
struct HpetRegisters {
    general_capabilities_and_id: ReadOnly<u64>, // 0x00
    _padding0: u64,
    general_configuration: Volatile<u64>, // 0x10
    _padding1: u64,
    general_interrupt_status: Volatile<u64>, // 0x20
    _padding2: [u64; (0xF0 - 0x28) / 8],
    main_counter_value: Volatile<u64>, // 0xF0
    _padding3: u64,
    comparators: [ComparatorRegisters; MAX_COMPARATORS], // 0x100
}
const_assert_eq!(core::mem::size_of::<HpetRegisters>(), 0x500);

struct HpetRegsPtr(*mut HpetRegisters);
unsafe impl Send for HpetRegsPtr {}
unsafe impl Sync for HpetRegsPtr {}

struct State {
    regs: HpetRegsPtr,
    descriptor: HpetDescriptor,
    period_femtoseconds: u32,
}

static STATE: Once<State> = Once::new();
const COMPARATOR_NOT_RUNNING: AtomicBool = AtomicBool::new(false);
static RUNNING: [AtomicBool; MAX_COMPARATORS] = [COMPARATOR_NOT_RUNNING; MAX_COMPARATORS];

fn state() -> &'static State {
    STATE.get().expect("hpet::init was not called")
}

fn regs() -> &'static mut HpetRegisters {
    unsafe { &mut *state().regs.0 }
}

/// Maps the HPET's MMIO block (from the ACPI-reported physical address)
/// into the shared MMIO window and starts the main counter running.
/// Legacy-replacement routing, if the hardware supports it, is left
/// disabled until the timer manager decides whether to use it.
///
/// # Safety
/// Must run exactly once, after `acpi::init` and after the kernel map is
/// in a state where `kernel_map.add` is safe to call.
pub unsafe fn init(allocator: &FrameAllocator, kernel_map: &MemoryMap, descriptor: HpetDescriptor) -> CoreResult<()> {
    let vaddr = VirtualAddress::new_canonical(SHARED_MMIO_BASE + HPET_MMIO_OFFSET);
    let frame = FrameId::from_physical_address(descriptor.address as usize);
    kernel_map.add(allocator, vaddr, frame, MapFlags::KERNEL_ONLY | MapFlags::NO_CACHE | MapFlags::NO_EXEC, None)?;

    let regs_ptr = vaddr.value() as *mut HpetRegisters;
    let capabilities = (*regs_ptr).general_capabilities_and_id.read();
    let period_femtoseconds = (capabilities >> 32) as u32;
    if period_femtoseconds == 0 {
        return Err(CoreError::NoCounter);
    }

    STATE.call_once(|| State { regs: HpetRegsPtr(regs_ptr), descriptor, period_femtoseconds });

    let regs = regs();
    regs.general_configuration.write(GENERAL_CONFIG_ENABLE);
    log::info!("hpet: {} comparators, {}-bit counter, {} fs period", descriptor.comparator_count, if descriptor.counter_width_64 { 64 } else { 32 }, period_femtoseconds);
    Ok(())
}

/// Whether `init` ran successfully, so the timer manager can fall back to
/// the PIT without unwrapping an `Option` at every call site.
pub fn is_present() -> bool {
    STATE.get().is_some()
}

pub fn counter_width_64() -> bool {
    state().descriptor.counter_width_64
}

pub fn num_comparators() -> u8 {
    state().descriptor.comparator_count
}

pub fn legacy_replacement_capable() -> bool {
    state().descriptor.legacy_replacement
}

/// Enables or disables legacy-replacement routing: while set, comparator 0
/// is wired to GSI0 and comparator 1 to GSI8, overriding whatever the
/// IOAPIC redirection table says for those two lines.
pub fn set_legacy_replacement(enable: bool) -> CoreResult<()> {
    if !legacy_replacement_capable() {
        return Err(CoreError::InvalidTimerMode);
    }
    let regs = regs();
    let mut config = regs.general_configuration.read();
    if enable {
        config |= GENERAL_CONFIG_LEGACY_REPLACEMENT;
    } else {
        config &= !GENERAL_CONFIG_LEGACY_REPLACEMENT;
    }
    regs.general_configuration.write(config);
    Ok(())
}

/// Femtoseconds per main-counter tick, as reported by the hardware.
pub fn period_femtoseconds() -> u32 {
    state().period_femtoseconds
}

/// Ticks per second, derived from [`period_femtoseconds`].
pub fn frequency_hz() -> u64 {
    1_000_000_000_000_000u64 / state().period_femtoseconds as u64
}

pub fn get_counter() -> u64 {
    regs().main_counter_value.read()
}

pub fn is_running(comparator: u8) -> bool {
    (comparator as usize) < MAX_COMPARATORS && RUNNING[comparator as usize].load(Ordering::Acquire)
}

fn comparator_or_bounds(comparator: u8) -> CoreResult<usize> {
    let idx = comparator as usize;
    if idx >= num_comparators() as usize || idx >= MAX_COMPARATORS {
        return Err(CoreError::OutOfBounds);
    }
    Ok(idx)
}

/// Arms `comparator` to fire repeatedly, `period_ticks` main-counter ticks
/// apart, with level-triggered delivery (required for periodic mode on
/// hardware that doesn't support re-arming on each fire automatically).
pub fn start_periodic(comparator: u8, period_ticks: u64) -> CoreResult<()> {
    let idx = comparator_or_bounds(comparator)?;
    if RUNNING[idx].swap(true, Ordering::AcqRel) {
        return Err(CoreError::TimerAlreadyRunning);
    }
    if period_ticks == 0 {
        RUNNING[idx].store(false, Ordering::Release);
        return Err(CoreError::TimerInvalidParams);
    }

    let regs = regs();
    let comparator_regs = &mut regs.comparators[idx];
    let capability = comparator_regs.configuration_and_capability.read();
    if capability & COMPARATOR_PERIODIC_CAPABLE == 0 {
        RUNNING[idx].store(false, Ordering::Release);
        return Err(CoreError::InvalidTimerMode);
    }

    let config = COMPARATOR_INT_TYPE_LEVEL | COMPARATOR_INT_ENABLE | COMPARATOR_TYPE_PERIODIC | COMPARATOR_VALUE_SET;
    comparator_regs.configuration_and_capability.write(config);
    let now = regs.main_counter_value.read();
    comparator_regs.comparator_value.write(now.wrapping_add(period_ticks));
    // A second write while VAL_SET is still set programs the periodic
    // accumulator; without it the comparator only ever fires once.
    comparator_regs.configuration_and_capability.write(config);
    comparator_regs.comparator_value.write(period_ticks);
    Ok(())
}

/// Arms `comparator` to fire once when the main counter reaches
/// `target_tick`.
pub fn start_one_shot(comparator: u8, target_tick: u64) -> CoreResult<()> {
    let idx = comparator_or_bounds(comparator)?;
    if RUNNING[idx].swap(true, Ordering::AcqRel) {
        return Err(CoreError::TimerAlreadyRunning);
    }

    let regs = regs();
    let comparator_regs = &mut regs.comparators[idx];
    comparator_regs.configuration_and_capability.write(COMPARATOR_INT_TYPE_LEVEL | COMPARATOR_INT_ENABLE);
    comparator_regs.comparator_value.write(target_tick);
    Ok(())
}

pub fn stop(comparator: u8) -> CoreResult<()> {
    let idx = comparator_or_bounds(comparator)?;
    let regs = regs();
    let comparator_regs = &mut regs.comparators[idx];
    let config = comparator_regs.configuration_and_capability.read();
    comparator_regs.configuration_and_capability.write(config & !COMPARATOR_INT_ENABLE);
    RUNNING[idx].store(false, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frequency_matches_period() {
        // 10 MHz equivalent (100 ns period): a clean round-trip sanity
        // check on the femtoseconds-per-tick to ticks-per-second math.
        let femtoseconds = 100_000_000u32;
        assert_eq!(1_000_000_000_000_000u64 / femtoseconds as u64, 10_000_000);
    }
}
