//! ACPI table discovery (C2): walks RSDP -> (R|X)SDT -> {MADT, FADT, HPET,
//! SRAT, SSDT} and exposes the topology and descriptors every other
//! platform-core crate needs at boot.

#![no_std]

extern crate alloc;

pub mod fadt;
pub mod hpet_table;
pub mod madt;
pub mod rsdp;
pub mod root_table;
pub mod sdt;
pub mod srat;

use alloc::vec::Vec;
use boot_params::AcpiHandoff;
use core_error::{CoreError, CoreResult};
use fadt::Fadt;
use hpet_table::HpetDescriptor;
use madt::{LocalApicEntry, Madt, MadtEntry};
use raw_cpuid::CpuId;
use root_table::RootTable;
use spin::Once;
use srat::{Srat, SratEntry};

pub use madt::{IntSourceOverrideEntry, IoApicEntry, IoApicNmiEntry, LocalApicNmiEntry};

/// One NUMA-merged processor affinity record (xAPIC and x2APIC SRAT
/// entries for the same LAPIC id are folded into one, per spec).
#[derive(Debug, Clone, Copy)]
pub struct NumaProcessor {
    pub apic_id: u32,
    pub domain: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct NumaMemoryRange {
    pub domain: u32,
    pub base: u64,
    pub length: u64,
}

pub struct AcpiTables {
    pub bsp_apic_id: u32,
    pub local_apics: Vec<LocalApicEntry>,
    pub io_apics: Vec<IoApicEntry>,
    pub int_source_overrides: Vec<IntSourceOverrideEntry>,
    pub io_apic_nmis: Vec<IoApicNmiEntry>,
    pub local_apic_nmis: Vec<LocalApicNmiEntry>,
    pub legacy_pic_present: bool,
    pub local_apic_address: u32,
    pub fadt: Fadt,
    pub hpet: Option<HpetDescriptor>,
    pub numa_processors: Vec<NumaProcessor>,
    pub numa_memory: Vec<NumaMemoryRange>,
    pub ssdt_count: usize,
}

static ACPI_TABLES: Once<AcpiTables> = Once::new();

/// Returns the parsed ACPI tables. Panics if [`init`] has not yet run --
/// every crate downstream of C2 is only ever called after boot ordering
/// guarantees this has succeeded.
pub fn get_acpi_tables() -> &'static AcpiTables {
    ACPI_TABLES.get().expect("acpi::init was not called before acpi::get_acpi_tables")
}

/// Walks the full ACPI table chain from the bootloader-supplied RSDP.
///
/// # Safety
/// The RSDP and every table it (transitively) points to must be
/// identity-mapped and readable for the duration of this call, per the
/// bootloader payload's handoff guarantee.
pub unsafe fn init(handoff: AcpiHandoff) -> CoreResult<&'static AcpiTables> {
    let rsdp = rsdp::parse_rsdp(handoff.rsdp_phys as usize, handoff.new_version)?;

    let root = if let Some(xsdt_addr) = rsdp.xsdt_address {
        RootTable::parse(xsdt_addr as usize, true)?
    } else {
        RootTable::parse(rsdp.rsdt_address as usize, false)?
    };

    let mut madt: Option<Madt> = None;
    let mut fadt: Option<Fadt> = None;
    let mut hpet: Option<HpetDescriptor> = None;
    let mut srat: Option<Srat> = None;
    let mut ssdt_count = 0usize;

    for child_addr in root.child_addresses() {
        let header = sdt::SdtHeader::from_addr(child_addr);
        match &header.signature {
            b"APIC" => madt = Some(Madt::parse(child_addr)?),
            b"FACP" => fadt = Some(Fadt::parse(child_addr)?),
            b"HPET" => hpet = Some(hpet_table::parse_hpet_table(child_addr)?),
            b"SRAT" => srat = Some(Srat::parse(child_addr)?),
            b"SSDT" => {
                // Acknowledged, never interpreted: there is no AML
                // interpreter in this workspace, per the non-goals.
                header.validate_checksum()?;
                ssdt_count += 1;
            }
            _ => {}
        }
    }

    let madt = madt.ok_or(CoreError::MissingMadt)?;
    let fadt = fadt.ok_or(CoreError::MissingFadt)?;

    let mut local_apics = Vec::new();
    let mut io_apics = Vec::new();
    let mut int_source_overrides = Vec::new();
    let mut io_apic_nmis = Vec::new();
    let mut local_apic_nmis = Vec::new();
    let mut local_apic_address_override = None;

    for entry in madt.entries() {
        match entry {
            MadtEntry::LocalApic(l) if l.enabled => local_apics.push(l),
            MadtEntry::LocalX2Apic(l) if l.enabled => local_apics.push(l),
            MadtEntry::IoApic(io) => io_apics.push(io),
            MadtEntry::IntSourceOverride(o) => int_source_overrides.push(o),
            MadtEntry::IoApicNmi(n) => io_apic_nmis.push(n),
            MadtEntry::LocalApicNmi(n) => local_apic_nmis.push(n),
            MadtEntry::LocalApicAddressOverride(addr) => local_apic_address_override = Some(addr),
            _ => {}
        }
    }

    if local_apics.is_empty() {
        return Err(CoreError::NoLapic);
    }

    let mut numa_processors: Vec<NumaProcessor> = Vec::new();
    let mut numa_memory = Vec::new();
    if let Some(srat) = srat {
        for entry in srat.entries() {
            match entry {
                SratEntry::Processor { apic_id, domain, enabled: true } => {
                    // Merge xAPIC and x2APIC entries for the same LAPIC id.
                    if let Some(existing) = numa_processors.iter_mut().find(|p| p.apic_id == apic_id) {
                        existing.domain = domain;
                    } else {
                        numa_processors.push(NumaProcessor { apic_id, domain });
                    }
                }
                SratEntry::Memory { domain, base, length, enabled: true } => {
                    numa_memory.push(NumaMemoryRange { domain, base, length });
                }
                _ => {}
            }
        }
    }

    let bsp_apic_id = identify_bsp(&local_apics);

    let tables = AcpiTables {
        bsp_apic_id,
        local_apics,
        io_apics,
        int_source_overrides,
        io_apic_nmis,
        local_apic_nmis,
        legacy_pic_present: madt.legacy_pic_present,
        local_apic_address: local_apic_address_override
            .map(|a| a as u32)
            .unwrap_or(madt.local_apic_address),
        fadt,
        hpet,
        numa_processors,
        numa_memory,
        ssdt_count,
    };

    Ok(ACPI_TABLES.call_once(|| tables))
}

/// Finds which MADT local-APIC entry is the bootstrap processor, via
/// CPUID's topology-enumeration leaf (preferred) or the legacy leaf-1
/// APIC id (fallback). Logs a warning and defaults to the first LAPIC
/// entry's id if neither matches any MADT entry.
fn identify_bsp(local_apics: &[LocalApicEntry]) -> u32 {
    let cpuid = CpuId::new();

    let topology_id = cpuid
        .get_extended_topology_info()
        .and_then(|mut it| it.next())
        .map(|l| l.x2apic_id())
        .or_else(|| cpuid.get_feature_info().map(|f| f.initial_local_apic_id() as u32));

    if let Some(id) = topology_id {
        if local_apics.iter().any(|l| l.apic_id == id) {
            return id;
        }
    }

    log::warn!("could not match CPUID-reported APIC id against any MADT local APIC entry; defaulting to the first entry");
    local_apics.first().map(|l| l.apic_id).unwrap_or(0)
}
