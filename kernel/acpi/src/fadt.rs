//! Fixed ACPI Description Table. Consumed only for the century register
//! byte offset, per spec; the rest of the FADT's power-management block is
//! out of scope here (owned by a separately specified ACPI-power module).

use crate::sdt::SdtHeader;
use core_error::{CoreError, CoreResult};

#[repr(C, packed)]
struct FadtRaw {
    sdt: SdtHeader,
    _firmware_ctrl: u32,
    _dsdt: u32,
    _reserved0: u8,
    _preferred_pm_profile: u8,
    _sci_interrupt: u16,
    _smi_command_port: u32,
    _acpi_enable: u8,
    _acpi_disable: u8,
    _s4bios_req: u8,
    _pstate_control: u8,
    _pm1a_event_block: u32,
    _pm1b_event_block: u32,
    _pm1a_control_block: u32,
    _pm1b_control_block: u32,
    _pm2_control_block: u32,
    _pm_timer_block: u32,
    _gpe0_block: u32,
    _gpe1_block: u32,
    _pm1_event_length: u8,
    _pm1_control_length: u8,
    _pm2_control_length: u8,
    _pm_timer_length: u8,
    _gpe0_length: u8,
    _gpe1_length: u8,
    _gpe1_base: u8,
    _cstate_control: u8,
    _worst_c2_latency: u16,
    _worst_c3_latency: u16,
    _flush_size: u16,
    _flush_stride: u16,
    _duty_offset: u8,
    _duty_width: u8,
    day_alarm: u8,
    month_alarm: u8,
    century: u8,
}

/// Retained by pointer -- the orchestrator keeps the whole `Fadt`, not a
/// copy, so downstream callers get a live view of the ACPI-provided byte
/// offset rather than a snapshot.
pub struct Fadt {
    addr: usize,
}

impl Fadt {
    /// # Safety
    /// `addr` must be the physical address of a checksum-valid FADT.
    pub unsafe fn parse(addr: usize) -> CoreResult<Fadt> {
        let raw = &*(addr as *const FadtRaw);
        raw.sdt.validate_checksum()?;
        if &raw.sdt.signature != b"FACP" {
            return Err(CoreError::MissingFadt);
        }
        Ok(Fadt { addr })
    }

    /// CMOS RTC register index holding the century digit, if the platform
    /// exposes one (`0` means absent, matching the ACPI spec's convention).
    pub fn century_register(&self) -> Option<u8> {
        // SAFETY: `self.addr` was validated as a live FADT in `parse`.
        let raw = unsafe { &*(self.addr as *const FadtRaw) };
        let century = raw.century;
        if century == 0 {
            None
        } else {
            Some(century)
        }
    }
}
