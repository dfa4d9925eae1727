//! Root System Description Pointer: the structure the bootloader payload's
//! ACPI handoff points at directly.

use core_error::{CoreError, CoreResult};

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RsdpV1 {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RsdpV2Extension {
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

pub struct Rsdp {
    pub rsdt_address: u32,
    /// `None` on ACPI 1.0 systems, where only the RSDT exists.
    pub xsdt_address: Option<u64>,
}

/// Parses and checksum-validates the RSDP at `rsdp_phys` (identity-mapped
/// by the bootloader payload's guarantee).
///
/// `new_version` is the flag the bootloader payload forwards alongside the
/// RSDP pointer; it selects whether the 20-byte v1 structure or the larger
/// v2 structure (with its own, separate checksum over the *added* bytes)
/// should be validated and read.
///
/// # Safety
/// `rsdp_phys` must be the physical address of a valid RSDP, identity
/// mapped for the duration of this call.
pub unsafe fn parse_rsdp(rsdp_phys: usize, new_version: bool) -> CoreResult<Rsdp> {
    let v1 = &*(rsdp_phys as *const RsdpV1);
    if &v1.signature != b"RSD PTR " {
        return Err(CoreError::MissingRsdp);
    }

    let v1_bytes = core::slice::from_raw_parts(rsdp_phys as *const u8, core::mem::size_of::<RsdpV1>());
    if v1_bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
        return Err(CoreError::BadChecksum);
    }

    let rsdt_address = v1.rsdt_address;

    let xsdt_address = if new_version && v1.revision >= 2 {
        let ext_addr = rsdp_phys + core::mem::size_of::<RsdpV1>();
        let ext = &*(ext_addr as *const RsdpV2Extension);
        let ext_bytes = core::slice::from_raw_parts(ext_addr as *const u8, core::mem::size_of::<RsdpV2Extension>());
        if ext_bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
            return Err(CoreError::BadChecksum);
        }
        Some(ext.xsdt_address)
    } else {
        None
    };

    Ok(Rsdp { rsdt_address, xsdt_address })
}

#[cfg(test)]
mod test {
    use super::*;

    /// Writes `v1` (and, if `ext` is `Some`, the v2 extension right after
    /// it) into `buf`, fixing up both checksums so each sums to zero.
    fn build(buf: &mut [u8; 36], v1: RsdpV1, ext: Option<RsdpV2Extension>) {
        unsafe {
            (buf.as_mut_ptr() as *mut RsdpV1).write_unaligned(v1);
            let v1_bytes = core::slice::from_raw_parts(buf.as_ptr(), core::mem::size_of::<RsdpV1>());
            let sum = v1_bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            buf[8] = buf[8].wrapping_sub(sum);

            if let Some(ext) = ext {
                let ext_addr = buf.as_mut_ptr().add(core::mem::size_of::<RsdpV1>());
                (ext_addr as *mut RsdpV2Extension).write_unaligned(ext);
                let ext_bytes = core::slice::from_raw_parts(ext_addr, core::mem::size_of::<RsdpV2Extension>());
                let sum = ext_bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                let checksum_offset = core::mem::size_of::<RsdpV1>() + 12;
                buf[checksum_offset] = buf[checksum_offset].wrapping_sub(sum);
            }
        }
    }

    fn v1_template(revision: u8) -> RsdpV1 {
        RsdpV1 { signature: *b"RSD PTR ", checksum: 0, oem_id: [0; 6], revision, rsdt_address: 0xDEAD_BEEF }
    }

    #[test]
    fn v1_only_table_parses_with_no_xsdt() {
        let mut buf = [0u8; 36];
        build(&mut buf, v1_template(0), None);
        let rsdp = unsafe { parse_rsdp(buf.as_ptr() as usize, false).unwrap() };
        assert_eq!(rsdp.rsdt_address, 0xDEAD_BEEF);
        assert!(rsdp.xsdt_address.is_none());
    }

    #[test]
    fn v2_table_parses_the_xsdt_extension_when_requested() {
        let mut buf = [0u8; 36];
        let ext = RsdpV2Extension { length: 36, xsdt_address: 0x1234_5678_9ABC, extended_checksum: 0, _reserved: [0; 3] };
        build(&mut buf, v1_template(2), Some(ext));
        let rsdp = unsafe { parse_rsdp(buf.as_ptr() as usize, true).unwrap() };
        assert_eq!(rsdp.xsdt_address, Some(0x1234_5678_9ABC));
    }

    #[test]
    fn v2_table_ignores_extension_when_new_version_is_false() {
        let mut buf = [0u8; 36];
        let ext = RsdpV2Extension { length: 36, xsdt_address: 0x1234_5678_9ABC, extended_checksum: 0, _reserved: [0; 3] };
        build(&mut buf, v1_template(2), Some(ext));
        let rsdp = unsafe { parse_rsdp(buf.as_ptr() as usize, false).unwrap() };
        assert!(rsdp.xsdt_address.is_none());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut buf = [0u8; 36];
        let mut v1 = v1_template(0);
        v1.signature = *b"WRONGSIG";
        build(&mut buf, v1, None);
        assert!(matches!(unsafe { parse_rsdp(buf.as_ptr() as usize, false) }, Err(CoreError::MissingRsdp)));
    }

    #[test]
    fn bad_v1_checksum_is_rejected() {
        let mut buf = [0u8; 36];
        build(&mut buf, v1_template(0), None);
        buf[8] = buf[8].wrapping_add(1); // flip the checksum byte after it was fixed up
        assert!(matches!(unsafe { parse_rsdp(buf.as_ptr() as usize, false) }, Err(CoreError::BadChecksum)));
    }

    #[test]
    fn bad_v2_extension_checksum_is_rejected() {
        let mut buf = [0u8; 36];
        let ext = RsdpV2Extension { length: 36, xsdt_address: 0, extended_checksum: 0, _reserved: [0; 3] };
        build(&mut buf, v1_template(2), Some(ext));
        let checksum_offset = core::mem::size_of::<RsdpV1>() + 12;
        buf[checksum_offset] = buf[checksum_offset].wrapping_add(1);
        assert!(matches!(unsafe { parse_rsdp(buf.as_ptr() as usize, true) }, Err(CoreError::BadChecksum)));
    }
}
