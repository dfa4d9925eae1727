//! The common 36-byte header shared by every ACPI system description table.

use core_error::{CoreError, CoreResult};

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    /// Reads the header from a mapped physical address without taking
    /// ownership of the bytes beyond it; callers reinterpret the same
    /// pointer as the table's full, signature-specific layout once the
    /// checksum has been verified.
    ///
    /// # Safety
    /// `addr` must point to at least `size_of::<SdtHeader>()` mapped,
    /// readable bytes.
    pub unsafe fn from_addr(addr: usize) -> &'static SdtHeader {
        &*(addr as *const SdtHeader)
    }

    pub fn signature_str(&self) -> &str {
        core::str::from_utf8(&self.signature).unwrap_or("????")
    }

    /// Validates that the whole table -- header included -- sums to zero
    /// over `self.length` bytes, per the ACPI checksum rule.
    ///
    /// # Safety
    /// The same `size_of::<SdtHeader>()`-mapped-bytes precondition as
    /// [`Self::from_addr`], extended out to `self.length` bytes.
    pub unsafe fn validate_checksum(&self) -> CoreResult<()> {
        let base = self as *const SdtHeader as *const u8;
        let len = self.length as usize;
        let mut sum: u8 = 0;
        for i in 0..len {
            sum = sum.wrapping_add(*base.add(i));
        }
        if sum == 0 {
            Ok(())
        } else {
            Err(CoreError::BadChecksum)
        }
    }
}
