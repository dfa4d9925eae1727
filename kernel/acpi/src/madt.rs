//! Multiple APIC Description Table: LAPIC/IOAPIC topology and interrupt
//! overrides. Parsed in two passes -- count then fill -- per spec, so the
//! orchestrator can size its `Vec`s exactly once.

use crate::sdt::SdtHeader;
use core_error::{CoreError, CoreResult};

#[repr(C, packed)]
struct MadtHeader {
    sdt: SdtHeader,
    local_apic_address: u32,
    flags: u32,
}

const FLAG_PCAT_COMPAT: u32 = 1 << 0;

#[derive(Debug, Clone, Copy)]
pub struct LocalApicEntry {
    pub acpi_processor_id: u8,
    pub apic_id: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IoApicEntry {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct IntSourceOverrideEntry {
    pub bus: u8,
    pub source_irq: u8,
    pub global_system_interrupt: u32,
    pub active_low: bool,
    pub level_triggered: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IoApicNmiEntry {
    pub global_system_interrupt: u32,
    pub active_low: bool,
    pub level_triggered: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalApicNmiEntry {
    /// `None` means "applies to every processor".
    pub acpi_processor_id: Option<u8>,
    pub lint: u8,
    pub active_low: bool,
    pub level_triggered: bool,
}

pub struct Madt {
    pub local_apic_address: u32,
    pub legacy_pic_present: bool,
    entries_base: usize,
    entries_len: usize,
}

/// A single, byte-offset-advancing walk of the variable-length entry list.
/// Each entry's own `length` byte is what determines the next entry's
/// offset -- never a fixed stride, and never the loop that fails to
/// advance at all (see `Srat`'s doc comment for the bug this must avoid).
pub struct MadtEntryIter<'a> {
    madt: &'a Madt,
    offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum MadtEntry {
    LocalApic(LocalApicEntry),
    IoApic(IoApicEntry),
    IntSourceOverride(IntSourceOverrideEntry),
    IoApicNmi(IoApicNmiEntry),
    LocalApicNmi(LocalApicNmiEntry),
    LocalApicAddressOverride(u64),
    LocalX2Apic(LocalApicEntry),
    Unknown { entry_type: u8 },
}

impl Madt {
    /// # Safety
    /// `addr` must be the physical address of a checksum-valid MADT.
    pub unsafe fn parse(addr: usize) -> CoreResult<Madt> {
        let header = &*(addr as *const MadtHeader);
        header.sdt.validate_checksum()?;
        if &header.sdt.signature != b"APIC" {
            return Err(CoreError::MissingMadt);
        }
        let entries_base = addr + core::mem::size_of::<MadtHeader>();
        let entries_len = header.sdt.length as usize - core::mem::size_of::<MadtHeader>();
        Ok(Madt {
            local_apic_address: header.local_apic_address,
            legacy_pic_present: header.flags & FLAG_PCAT_COMPAT != 0,
            entries_base,
            entries_len,
        })
    }

    pub fn entries(&self) -> MadtEntryIter<'_> {
        MadtEntryIter { madt: self, offset: 0 }
    }

    pub fn local_apic_count(&self) -> usize {
        self.entries()
            .filter(|e| matches!(e, MadtEntry::LocalApic(l) | MadtEntry::LocalX2Apic(l) if l.enabled))
            .count()
    }
}

impl<'a> Iterator for MadtEntryIter<'a> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        if self.offset + 2 > self.madt.entries_len {
            return None;
        }
        let entry_addr = self.madt.entries_base + self.offset;
        // SAFETY: bounds checked against `entries_len` above; `parse`
        // guaranteed `entries_base..+entries_len` is within the checksummed
        // table.
        let (entry_type, length) = unsafe {
            let p = entry_addr as *const u8;
            (*p, *p.add(1))
        };
        if length < 2 || self.offset + length as usize > self.madt.entries_len {
            return None;
        }
        let entry = unsafe { decode_entry(entry_addr, entry_type) };
        self.offset += length as usize;
        Some(entry)
    }
}

unsafe fn decode_entry(addr: usize, entry_type: u8) -> MadtEntry {
    match entry_type {
        0 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], acpi_processor_id: u8, apic_id: u8, flags: u32 }
            let r = &*(addr as *const Raw);
            MadtEntry::LocalApic(LocalApicEntry {
                acpi_processor_id: r.acpi_processor_id,
                apic_id: r.apic_id as u32,
                enabled: r.flags & 1 != 0,
            })
        }
        1 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], id: u8, _reserved: u8, address: u32, gsi_base: u32 }
            let r = &*(addr as *const Raw);
            MadtEntry::IoApic(IoApicEntry { id: r.id, address: r.address, gsi_base: r.gsi_base })
        }
        2 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], bus: u8, source: u8, gsi: u32, flags: u16 }
            let r = &*(addr as *const Raw);
            MadtEntry::IntSourceOverride(IntSourceOverrideEntry {
                bus: r.bus,
                source_irq: r.source,
                global_system_interrupt: r.gsi,
                active_low: r.flags & 0b11 == 0b11,
                level_triggered: (r.flags >> 2) & 0b11 == 0b11,
            })
        }
        3 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], _nmi_source: u8, _reserved: u8, flags: u16, gsi: u32 }
            let r = &*(addr as *const Raw);
            MadtEntry::IoApicNmi(IoApicNmiEntry {
                global_system_interrupt: r.gsi,
                active_low: r.flags & 0b11 == 0b11,
                level_triggered: (r.flags >> 2) & 0b11 == 0b11,
            })
        }
        4 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], acpi_processor_id: u8, flags: u16, lint: u8 }
            let r = &*(addr as *const Raw);
            MadtEntry::LocalApicNmi(LocalApicNmiEntry {
                acpi_processor_id: if r.acpi_processor_id == 0xFF { None } else { Some(r.acpi_processor_id) },
                lint: r.lint,
                active_low: r.flags & 0b11 == 0b11,
                level_triggered: (r.flags >> 2) & 0b11 == 0b11,
            })
        }
        5 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], _reserved: u16, address: u64 }
            let r = &*(addr as *const Raw);
            MadtEntry::LocalApicAddressOverride(r.address)
        }
        9 => {
            #[repr(C, packed)]
            struct Raw { _h: [u8; 2], _reserved: u16, x2apic_id: u32, flags: u32, acpi_processor_uid: u32 }
            let r = &*(addr as *const Raw);
            MadtEntry::LocalX2Apic(LocalApicEntry {
                acpi_processor_id: r.acpi_processor_uid as u8,
                apic_id: r.x2apic_id,
                enabled: r.flags & 1 != 0,
            })
        }
        other => MadtEntry::Unknown { entry_type: other },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec::Vec;

    /// Builds a minimal, checksum-valid MADT: the 44-byte header followed
    /// by one `LocalApic` entry and one `IoApic` entry, each at its real
    /// ACPI-defined length so the iterator must advance by that length
    /// (not a fixed stride) to find the second entry -- the exact defect
    /// this crate's entry walk is written to avoid (see the module doc
    /// comment on `MadtEntryIter`).
    fn build_madt() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 44 + 8 + 12];
        buf[0..4].copy_from_slice(b"APIC");
        buf[4..8].copy_from_slice(&(buf.len() as u32).to_le_bytes());
        buf[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes()); // local_apic_address
        buf[40..44].copy_from_slice(&FLAG_PCAT_COMPAT.to_le_bytes()); // flags

        let e0 = &mut buf[44..52];
        e0[0] = 0; // LocalApic
        e0[1] = 8; // length
        e0[2] = 7; // acpi_processor_id
        e0[3] = 3; // apic_id
        e0[4..8].copy_from_slice(&1u32.to_le_bytes()); // enabled

        let e1 = &mut buf[52..64];
        e1[0] = 1; // IoApic
        e1[1] = 12; // length
        e1[2] = 9; // id
        e1[4..8].copy_from_slice(&0xFEC0_0000u32.to_le_bytes()); // address
        e1[8..12].copy_from_slice(&16u32.to_le_bytes()); // gsi_base

        let sum = buf.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        buf[9] = buf[9].wrapping_sub(sum); // checksum byte, offset 9 in SdtHeader
        buf
    }

    #[test]
    fn entries_are_walked_by_their_own_length_not_a_fixed_stride() {
        let buf = build_madt();
        let madt = unsafe { Madt::parse(buf.as_ptr() as usize).unwrap() };
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);
        assert!(madt.legacy_pic_present);

        let entries: Vec<MadtEntry> = madt.entries().collect();
        assert_eq!(entries.len(), 2);
        match entries[0] {
            MadtEntry::LocalApic(l) => {
                assert_eq!(l.acpi_processor_id, 7);
                assert_eq!(l.apic_id, 3);
                assert!(l.enabled);
            }
            other => panic!("expected LocalApic, got {other:?}"),
        }
        match entries[1] {
            MadtEntry::IoApic(io) => {
                assert_eq!(io.id, 9);
                assert_eq!(io.address, 0xFEC0_0000);
                assert_eq!(io.gsi_base, 16);
            }
            other => panic!("expected IoApic, got {other:?}"),
        }
    }

    #[test]
    fn local_apic_count_only_counts_enabled_entries() {
        let mut buf = build_madt();
        // Clear the first entry's enabled bit.
        buf[48..52].copy_from_slice(&0u32.to_le_bytes());
        let sum_fixup_offset = 9;
        buf[sum_fixup_offset] = 0;
        let sum = buf.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        buf[sum_fixup_offset] = 0u8.wrapping_sub(sum);

        let madt = unsafe { Madt::parse(buf.as_ptr() as usize).unwrap() };
        assert_eq!(madt.local_apic_count(), 0);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut buf = build_madt();
        buf[0..4].copy_from_slice(b"XXXX");
        // Checksum is validated before the signature; re-fix it up so this
        // test actually exercises the signature check.
        buf[9] = 0;
        let sum = buf.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        buf[9] = 0u8.wrapping_sub(sum);
        assert!(matches!(unsafe { Madt::parse(buf.as_ptr() as usize) }, Err(CoreError::MissingMadt)));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut buf = build_madt();
        buf[9] = buf[9].wrapping_add(1);
        assert!(matches!(unsafe { Madt::parse(buf.as_ptr() as usize) }, Err(CoreError::BadChecksum)));
    }
}
