//! SMP bring-up (part of C8): the INIT/SIPI sequence that wakes each
//! non-bootstrap core MADT describes, the stack each one gets handed, and
//! the started-counter barrier the bring-up loop polls.
//!
//! The real-mode-to-long-mode trampoline that the SIPI vector actually
//! points execution at is not this crate's concern: [`AP_INIT_FRAME`] is
//! assumed to already hold a working stub, installed by an earlier boot
//! stage, that reads [`ApControlBlock`] and jumps to `entry_point` on
//! `stack_top` once it reaches long mode. This crate's job stops at
//! handing that stub the right inputs and recognizing when a core never
//! took them.

#![no_std]

extern crate alloc;

use acpi::get_acpi_tables;
use alloc::vec::Vec;
use apic::DeliveryMode;
use core::sync::atomic::{AtomicU32, Ordering};
use core_error::{CoreError, CoreResult};
use frame_allocator::FrameAllocator;
use kernel_config::memory::AP_INIT_FRAME;
use kernel_config::time::{AP_INIT_DELAY_MICROS, AP_SIPI_DELAY_MICROS, AP_START_TIMEOUT_MICROS};
use kheap::KernelHeap;
use page_table::MemoryMap;

/// Stack size handed to every application processor. Freed only if the
/// core never starts (an already-running core's stack lives as long as
/// the core does).
const AP_STACK_SIZE: usize = 64 * 1024;

/// What the real-mode trampoline is assumed to read out of low memory
/// before jumping into long mode: where to set the stack pointer and
/// where to jump once paging is live. Control-block address is the data
/// word at the very end of the trampoline's own page, arch-conventional
/// and stable across boots.
#[repr(C)]
struct ApControlBlock {
    entry_point: u64,
    stack_top: u64,
}

const CONTROL_BLOCK_OFFSET: usize = 0xFF0;

fn control_block_ptr() -> *mut ApControlBlock {
    let phys = AP_INIT_FRAME * kernel_config::memory::PAGE_SIZE + CONTROL_BLOCK_OFFSET;
    // Identity-mapped: everything at or below the physical-aperture base
    // is addressable 1:1 this early, per the same assumption `acpi::init`
    // makes about the RSDP chain.
    phys as *mut ApControlBlock
}

/// Count of application processors that have reached `cpu::init_this_cpu`
/// and incremented this, used as the bring-up loop's barrier. Each AP's
/// early Rust entry point (reached via the trampoline above) is expected
/// to call [`notify_started`] exactly once.
static STARTED_COUNT: AtomicU32 = AtomicU32::new(1); // BSP counts as started

/// Called by an application processor's early entry code once it has run
/// `cpu::init_this_cpu` and is ready to be counted as up.
pub fn notify_started() {
    STARTED_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Starts every MADT-enumerated local APIC other than the bootstrap
/// processor's own, in ascending MADT order. A core that never starts is
/// reported as `Err(CoreError::ApDidNotStart(lapic_id))` in its slot but
/// does not stop the remaining cores from being attempted.
///
/// # Safety
/// Must run on the BSP, after `apic::init`, after the kernel heap and
/// kernel map are both initialized, and with `entry_point` pointing at
/// code that is safe to run in long mode on a freshly allocated stack
/// with nothing else set up.
pub unsafe fn start_aux_processors(allocator: &FrameAllocator, kernel_map: &MemoryMap, heap: &KernelHeap, entry_point: extern "C" fn() -> !) -> Vec<CoreResult<u32>> {
    let tables = get_acpi_tables();
    let bsp_id = tables.bsp_apic_id;
    let mut results = Vec::new();

    for (index, local) in tables.local_apics.iter().enumerate().filter(|(_, l)| l.apic_id != bsp_id) {
        results.push(start_one(allocator, kernel_map, heap, index as u32, local.apic_id, entry_point));
    }
    results
}

/// `madt_index` is this core's position in the ACPI table's local-APIC
/// list -- the handle `apic::send_ipi` actually wants, since it resolves
/// to a LAPIC id internally. `lapic_id` is kept only for logging and the
/// returned identifier.
fn start_one(allocator: &FrameAllocator, kernel_map: &MemoryMap, heap: &KernelHeap, madt_index: u32, lapic_id: u32, entry_point: extern "C" fn() -> !) -> CoreResult<u32> {
    let stack = heap.alloc(allocator, kernel_map, AP_STACK_SIZE, false)?;
    let stack_top = stack as u64 + AP_STACK_SIZE as u64;

    unsafe {
        let block = control_block_ptr();
        (*block).entry_point = entry_point as u64;
        (*block).stack_top = stack_top;
    }

    let expected = STARTED_COUNT.load(Ordering::Acquire) + 1;

    apic::send_ipi(madt_index, 0, DeliveryMode::Init, false, false)?;
    timer::delay(AP_INIT_DELAY_MICROS * 1_000);

    let mut sipi_attempts = 0;
    loop {
        apic::send_ipi(madt_index, 0, DeliveryMode::StartUp(AP_INIT_FRAME as u8), false, false)?;
        timer::delay(AP_SIPI_DELAY_MICROS * 1_000);
        sipi_attempts += 1;

        if wait_for_started(expected, AP_START_TIMEOUT_MICROS / 2) {
            return Ok(lapic_id);
        }
        if sipi_attempts >= 2 {
            log::warn!("processor {lapic_id} (lapic id) did not start after {sipi_attempts} SIPIs");
            heap.free(allocator, kernel_map, stack)?;
            return Err(CoreError::ApDidNotStart(lapic_id));
        }
    }
}

fn wait_for_started(expected: u32, timeout_micros: u64) -> bool {
    let deadline_ticks_nanos = timeout_micros * 1_000;
    let start = timer::counter().counter();
    let Ok(hz) = timer::counter().frequency_hz() else {
        return STARTED_COUNT.load(Ordering::Acquire) >= expected;
    };
    let timeout_ticks = (deadline_ticks_nanos as u128 * hz as u128 / 1_000_000_000u128) as u64;

    loop {
        if STARTED_COUNT.load(Ordering::Acquire) >= expected {
            return true;
        }
        if timer::counter().counter().wrapping_sub(start) >= timeout_ticks {
            return STARTED_COUNT.load(Ordering::Acquire) >= expected;
        }
        core::hint::spin_loop();
    }
}

/// Number of cores (BSP included) currently counted as started.
pub fn started_count() -> u32 {
    STARTED_COUNT.load(Ordering::Acquire)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn started_count_begins_at_one() {
        assert!(started_count() >= 1);
    }
}
