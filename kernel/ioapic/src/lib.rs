//! I/O APIC register access (part of C6): redirection-table encode/decode
//! and the low/high register pair every entry is split across.
//!
//! An `IoApic` only wraps an already-mapped MMIO window; placing that
//! window in the shared MMIO aperture and tracking which global interrupt
//! range each chip owns is the driver's job, not this crate's.

#![no_std]

use core_error::{CoreError, CoreResult};
use kernel_config::memory::PAGE_SIZE;
use volatile::{Volatile, WriteOnly};

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_ARBITRATION: u32 = 0x02;
const REG_REDIRECTION_BASE: u32 = 0x10;

#[repr(C)]
struct IoApicRegisters {
    register_index: WriteOnly<u32>,
    _padding0: [u32; 3],
    register_data: Volatile<u32>,
    _padding1: [u32; 3],
}

/// One decoded redirection-table entry (32 bits low + 32 bits high).
#[derive(Debug, Clone, Copy)]
pub struct RedirectionEntry {
    pub vector: u8,
    /// 0 = fixed, 1 = lowest priority, 4 = NMI, 7 = ExtINT.
    pub delivery_mode: u8,
    pub logical_destination: bool,
    pub active_low: bool,
    pub level_triggered: bool,
    pub masked: bool,
    pub destination: u8,
}

impl RedirectionEntry {
    fn to_bits(self) -> (u32, u32) {
        let mut low = self.vector as u32;
        low |= (self.delivery_mode as u32 & 0b111) << 8;
        if self.logical_destination {
            low |= 1 << 11;
        }
        if self.active_low {
            low |= 1 << 13;
        }
        if self.level_triggered {
            low |= 1 << 15;
        }
        if self.masked {
            low |= 1 << 16;
        }
        let high = (self.destination as u32) << 24;
        (low, high)
    }

    fn from_bits(low: u32, high: u32) -> RedirectionEntry {
        RedirectionEntry {
            vector: (low & 0xFF) as u8,
            delivery_mode: ((low >> 8) & 0b111) as u8,
            logical_destination: low & (1 << 11) != 0,
            active_low: low & (1 << 13) != 0,
            level_triggered: low & (1 << 15) != 0,
            masked: low & (1 << 16) != 0,
            destination: (high >> 24) as u8,
        }
    }
}

/// One I/O APIC chip, reached through an already-mapped MMIO window.
pub struct IoApic {
    regs: *mut IoApicRegisters,
    pub id: u8,
    pub gsi_base: u32,
    max_entries: u32,
}

// The MMIO window is uncached device memory; nothing here is actually
// thread-local, and callers serialize access with their own lock (the
// driver's per-IOAPIC register-window lock, per the platform core's
// lock ordering).
unsafe impl Send for IoApic {}

impl IoApic {
    /// # Safety
    /// `virt_base` must be a `PAGE_SIZE`-sized, uncached, writable mapping
    /// of this chip's physical register window, owned exclusively by the
    /// returned `IoApic` from this call onward.
    pub unsafe fn new(virt_base: usize, id: u8, gsi_base: u32) -> IoApic {
        let regs = virt_base as *mut IoApicRegisters;
        let mut ioapic = IoApic { regs, id, gsi_base, max_entries: 0 };
        let version = ioapic.read_reg(REG_VERSION);
        ioapic.max_entries = ((version >> 16) & 0xFF) + 1;
        ioapic
    }

    pub fn handles_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.max_entries
    }

    fn read_reg(&mut self, index: u32) -> u32 {
        unsafe {
            (*self.regs).register_index.write(index);
            (*self.regs).register_data.read()
        }
    }

    fn write_reg(&mut self, index: u32, value: u32) {
        unsafe {
            (*self.regs).register_index.write(index);
            (*self.regs).register_data.write(value);
        }
    }

    pub fn arbitration_id(&mut self) -> u32 {
        self.read_reg(REG_ARBITRATION)
    }

    /// Writes a redirection entry for the given global interrupt number.
    /// `gsi` must be within `[gsi_base, gsi_base + max_entries)`.
    pub fn set_entry(&mut self, gsi: u32, entry: RedirectionEntry) -> CoreResult<()> {
        if !self.handles_gsi(gsi) {
            return Err(CoreError::OutOfBounds);
        }
        let local = gsi - self.gsi_base;
        let (low, high) = entry.to_bits();
        self.write_reg(REG_REDIRECTION_BASE + local * 2 + 1, high);
        self.write_reg(REG_REDIRECTION_BASE + local * 2, low);
        Ok(())
    }

    pub fn get_entry(&mut self, gsi: u32) -> CoreResult<RedirectionEntry> {
        if !self.handles_gsi(gsi) {
            return Err(CoreError::OutOfBounds);
        }
        let local = gsi - self.gsi_base;
        let low = self.read_reg(REG_REDIRECTION_BASE + local * 2);
        let high = self.read_reg(REG_REDIRECTION_BASE + local * 2 + 1);
        Ok(RedirectionEntry::from_bits(low, high))
    }

    pub fn mask(&mut self, gsi: u32) -> CoreResult<()> {
        let mut entry = self.get_entry(gsi)?;
        entry.masked = true;
        self.set_entry(gsi, entry)
    }

    pub fn unmask(&mut self, gsi: u32) -> CoreResult<()> {
        let mut entry = self.get_entry(gsi)?;
        entry.masked = false;
        self.set_entry(gsi, entry)
    }
}

/// Bytes of MMIO window each IOAPIC needs; always exactly one page.
pub const IOAPIC_MMIO_SIZE: usize = PAGE_SIZE;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redirection_entry_round_trips_through_its_bit_layout() {
        let entry = RedirectionEntry {
            vector: 0x42,
            delivery_mode: 0b101,
            logical_destination: true,
            active_low: true,
            level_triggered: true,
            masked: false,
            destination: 0x07,
        };
        let (low, high) = entry.to_bits();
        let decoded = RedirectionEntry::from_bits(low, high);
        assert_eq!(decoded.vector, entry.vector);
        assert_eq!(decoded.delivery_mode, entry.delivery_mode);
        assert_eq!(decoded.logical_destination, entry.logical_destination);
        assert_eq!(decoded.active_low, entry.active_low);
        assert_eq!(decoded.level_triggered, entry.level_triggered);
        assert_eq!(decoded.masked, entry.masked);
        assert_eq!(decoded.destination, entry.destination);
    }

    #[test]
    fn masked_bit_is_independent_of_the_other_fields() {
        let base = RedirectionEntry {
            vector: 0x20,
            delivery_mode: 0,
            logical_destination: false,
            active_low: false,
            level_triggered: false,
            masked: false,
            destination: 0,
        };
        let (low, _) = base.to_bits();
        assert_eq!(low & (1 << 16), 0);
        let mut masked = base;
        masked.masked = true;
        let (low, _) = masked.to_bits();
        assert_ne!(low & (1 << 16), 0);
    }
}
