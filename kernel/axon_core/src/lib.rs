//! Top-level platform core.
//!
//! `init` is the single entry point the bootloader's trampoline calls,
//! in the identity-mapped environment the payload guarantees. It wires
//! every subsystem crate together in the one order boot correctness
//! depends on: payload validation, ACPI discovery, the physical frame
//! table, the kernel's own address space, the kernel heap, the
//! interrupt driver, the C9/C10 timer sources, SMP bring-up, and
//! finally cross-core messaging.
//!
//! Nothing here switches `CR3` to the kernel map this crate builds: the
//! bootloader's own identity-mapped tables stay live for the rest of
//! this boot, so every pointer handed out during `init` (the frame
//! table, the heap, the LAPIC/IOAPIC/HPET MMIO windows) is reachable
//! through them exactly as it would be through the kernel map. Activating
//! the kernel map itself is left to a later boot stage this workspace
//! does not own, the same way the AP real-mode trampoline is.

#![no_std]

extern crate alloc;

use acpi::AcpiTables;
use alloc::vec::Vec;
pub use boot_params::{FramebufferInfo, MemoryMapEntry, MemoryRegionType};
use core_error::{CoreError, CoreResult};
use frame_allocator::{FrameAllocator, FrameRecord, MemoryRegion, RegionKind};
use kernel_config::memory::PAGE_SIZE;
use kheap::KernelHeap;
use memory_structs::FrameId;
use page_table::MemoryMap;

/// Initial kernel heap size, mapped eagerly during `init`; `kheap` grows
/// it further on demand.
const INITIAL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Redirection-table lines per I/O APIC chip this platform core assumes
/// when no other source of truth (e.g. per-chip version register) is
/// consulted yet at `interrupts::init` time -- every chip this pack's
/// reference hardware exposes reports 24.
const ASSUMED_IOAPIC_LINES: u32 = 24;

/// Everything `init` hands back to its caller once every subsystem is up.
pub struct PlatformCore {
    pub acpi_tables: &'static AcpiTables,
    pub bsp_cpu: cpu::CpuId,
    /// One entry per application processor the MADT describes, in MADT
    /// order: `Ok(lapic_id)` if it started, `Err` (with the reason) if
    /// it did not. Bring-up continues past a failure; this is the
    /// per-core report of it.
    pub ap_results: Vec<CoreResult<u32>>,
}

/// Validates and ingests the bootloader payload, then brings up every
/// platform-core subsystem in boot order.
///
/// `ap_entry_point` is the function each application processor jumps to
/// in long mode, on its own freshly allocated stack, once the trampoline
/// this crate assumes is preinstalled at [`kernel_config::memory::AP_INIT_FRAME`]
/// hands off. Pass [`default_ap_entry`] unless the caller has its own.
///
/// # Safety
/// Must be called exactly once, on the bootstrap processor, as the very
/// first platform-core call the trampoline makes, with every pointer in
/// `memory_map` and `framebuffer` still identity-mapped as the payload
/// guarantees.
pub unsafe fn init(
    magic: u64,
    arch_code: u32,
    rsdp_phys: u64,
    new_version: bool,
    framebuffer: boot_params::FramebufferInfo,
    memory_map: &[boot_params::MemoryMapEntry],
    ap_entry_point: extern "C" fn() -> !,
) -> CoreResult<PlatformCore> {
    let _ = early_logger::init(log::LevelFilter::Info);

    boot_params::validate_payload(magic)?;
    let handoff = boot_params::parse_acpi_handoff(magic, arch_code, rsdp_phys, new_version)?;

    let tables = acpi::init(handoff)?;
    log::info!("acpi: {} local APICs, {} I/O APICs, hpet present: {}", tables.local_apics.len(), tables.io_apics.len(), tables.hpet.is_some());

    let allocator = build_frame_allocator(memory_map)?;
    let kernel_map = build_kernel_map(&allocator, memory_map, &framebuffer)?;
    let heap = KernelHeap::init(&allocator, &kernel_map, INITIAL_HEAP_SIZE)?;

    apic::init(&allocator, &kernel_map)?;

    let max_gsi = tables.io_apics.iter().map(|e| e.gsi_base + ASSUMED_IOAPIC_LINES).max().unwrap_or(ASSUMED_IOAPIC_LINES);
    interrupts::init(max_gsi);
    panic_core::set_halt_others(apic::broadcast_halt_ipi);

    if let Some(hpet_descriptor) = tables.hpet {
        hpet::init(&allocator, &kernel_map, hpet_descriptor)?;
    }
    timer::init()?;

    let bsp_cpu = cpu::init_this_cpu(tables.bsp_apic_id);
    interlink::init(tables.local_apics.len().max(1));

    // Establishes the TSC/external-timer reference point every AP's own
    // `ap_sync` call reads back *before* any AP is started, since each AP
    // runs `ap_sync` as part of its own bring-up, ahead of reporting
    // itself started -- it must never race `bsp_sync` for that reference.
    timer::bsp_sync();
    let ap_results = ap_start::start_aux_processors(&allocator, &kernel_map, &heap, ap_entry_point);

    for result in &ap_results {
        if let Err(e) = result {
            log::warn!("an application processor failed to start: {e}");
        }
    }

    Ok(PlatformCore { acpi_tables: tables, bsp_cpu, ap_results })
}

/// The bring-up path each application processor runs once the trampoline
/// hands it off, on its own stack, in long mode. Establishes this core's
/// identity, brings its own LAPIC to a known-good state, joins the TSC
/// sync barrier, and reports itself started before falling into its
/// handler-dispatch idle loop.
///
/// # Safety
/// Must only ever be reached via the SMP bring-up trampoline, on a core
/// that has not yet called any platform-core function.
pub extern "C" fn default_ap_entry() -> ! {
    let arch_id = apic::current_lapic_id();
    let os_id = cpu::init_this_cpu(arch_id);
    apic::aux_init();
    timer::ap_sync(os_id.value());
    ap_start::notify_started();

    loop {
        interlink::dispatch_for_current_cpu();
        core::hint::spin_loop();
    }
}

/// Builds the physical frame allocator over `memory_map`, carving the
/// frame-record table itself out of the largest available region (the
/// table is never itself one of the frames it tracks).
fn build_frame_allocator(memory_map: &[boot_params::MemoryMapEntry]) -> CoreResult<FrameAllocator> {
    // An empty memory map leaves nothing for the allocator to track,
    // which is the same failure shape as never finding a run of frames.
    let total_frames = memory_map.iter().map(|e| e.base as usize / PAGE_SIZE + e.pages as usize).max().ok_or(CoreError::OutOfFrames)?;

    let table_bytes = total_frames * core::mem::size_of::<FrameRecord>();
    let table_frames = (table_bytes + PAGE_SIZE - 1) / PAGE_SIZE;

    let table_region = memory_map
        .iter()
        .filter(|e| e.region_type == boot_params::MemoryRegionType::Available && e.pages as usize >= table_frames)
        .max_by_key(|e| e.pages)
        .ok_or(CoreError::OutOfFrames)?;

    let table_first_frame = table_region.base as usize / PAGE_SIZE;
    let table_memory = (table_first_frame * PAGE_SIZE) as *mut FrameRecord;

    let regions: Vec<MemoryRegion> = memory_map
        .iter()
        .map(|e| {
            let first_frame = FrameId::new(e.base as usize / PAGE_SIZE);
            let frame_count = if e.base as usize / PAGE_SIZE == table_first_frame { (e.pages as usize).saturating_sub(table_frames) } else { e.pages as usize };
            let first_frame = if e.base as usize / PAGE_SIZE == table_first_frame { FrameId::new(table_first_frame + table_frames) } else { first_frame };
            MemoryRegion { first_frame, frame_count, kind: region_kind(e.region_type) }
        })
        .collect();

    // SAFETY: `table_memory` is page-aligned, large enough for
    // `total_frames` records, carved out of an `Available` region not
    // otherwise described as present in `regions`, and reachable through
    // the bootloader's identity mapping this function runs under.
    Ok(unsafe { FrameAllocator::init(table_memory, total_frames, &regions) })
}

fn region_kind(kind: boot_params::MemoryRegionType) -> RegionKind {
    match kind {
        boot_params::MemoryRegionType::Available => RegionKind::Available,
        boot_params::MemoryRegionType::Acpi => RegionKind::Acpi,
        boot_params::MemoryRegionType::Bootloader => RegionKind::Bootloader,
        boot_params::MemoryRegionType::Reserved | boot_params::MemoryRegionType::MappedIo => RegionKind::Reserved,
    }
}

/// Builds the kernel's singleton address space, mapping every physically
/// backed range the payload described (everything but reserved holes and
/// device MMIO windows, which get their own uncached mappings on demand
/// instead of a huge-page aperture entry) into the physical aperture, plus
/// the framebuffer range the payload hands off separately from the memory
/// map proper.
fn build_kernel_map(allocator: &FrameAllocator, memory_map: &[boot_params::MemoryMapEntry], framebuffer: &boot_params::FramebufferInfo) -> CoreResult<MemoryMap> {
    let present_ranges: Vec<(FrameId, usize)> = memory_map
        .iter()
        .filter(|e| !matches!(e.region_type, boot_params::MemoryRegionType::Reserved | boot_params::MemoryRegionType::MappedIo))
        .map(|e| (FrameId::new(e.base as usize / PAGE_SIZE), e.pages as usize))
        .collect();

    let framebuffer_range = (framebuffer.size > 0).then(|| {
        let first_frame = FrameId::new(framebuffer.phys as usize / PAGE_SIZE);
        let frame_count = (framebuffer.size as usize + PAGE_SIZE - 1) / PAGE_SIZE;
        (first_frame, frame_count)
    });

    MemoryMap::new_kernel_map(allocator, &present_ranges, framebuffer_range)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn region_kind_maps_every_variant() {
        assert_eq!(region_kind(boot_params::MemoryRegionType::Available), RegionKind::Available);
        assert_eq!(region_kind(boot_params::MemoryRegionType::Acpi), RegionKind::Acpi);
        assert_eq!(region_kind(boot_params::MemoryRegionType::Bootloader), RegionKind::Bootloader);
        assert_eq!(region_kind(boot_params::MemoryRegionType::Reserved), RegionKind::Reserved);
        assert_eq!(region_kind(boot_params::MemoryRegionType::MappedIo), RegionKind::Reserved);
    }
}
