//! The ACPI HPET descriptor table: address and capability summary for the
//! timer driver (distinct from the `hpet` crate's MMIO driver, which reads
//! the fields this module parses but never the raw ACPI bytes directly).

use crate::sdt::SdtHeader;
use core_error::{CoreError, CoreResult};

#[repr(C, packed)]
struct GenericAddressStructure {
    _address_space: u8,
    _bit_width: u8,
    _bit_offset: u8,
    _access_size: u8,
    address: u64,
}

#[repr(C, packed)]
struct HpetTableRaw {
    sdt: SdtHeader,
    event_timer_block_id: u32,
    base_address: GenericAddressStructure,
    hpet_number: u8,
    min_clock_tick: u16,
    page_protection: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct HpetDescriptor {
    pub address: u64,
    pub counter_width_64: bool,
    pub comparator_count: u8,
    pub min_clock_tick: u16,
    pub legacy_replacement: bool,
}

/// # Safety
/// `addr` must be the physical address of a checksum-valid HPET table.
pub unsafe fn parse_hpet_table(addr: usize) -> CoreResult<HpetDescriptor> {
    let raw = &*(addr as *const HpetTableRaw);
    raw.sdt.validate_checksum()?;
    if &raw.sdt.signature != b"HPET" {
        return Err(CoreError::BadChecksum);
    }
    let id = raw.event_timer_block_id;
    Ok(HpetDescriptor {
        address: raw.base_address.address,
        counter_width_64: (id >> 13) & 1 != 0,
        comparator_count: ((id >> 8) & 0b1_1111) as u8 + 1,
        min_clock_tick: raw.min_clock_tick,
        legacy_replacement: (id >> 15) & 1 != 0,
    })
}
