//! RSDT/XSDT: the array of child-table pointers the RSDP points at.
//!
//! The RSDT holds 32-bit child pointers and the XSDT holds 64-bit ones;
//! both are walked through the same iterator here by having each caller
//! supply the pointer width up front, rather than inferring it per-entry
//! (the original source's bug was exactly this: indexing into the child
//! array with one pointer width while the table it parsed used the other).

use crate::sdt::SdtHeader;
use core_error::CoreResult;

pub enum RootTable {
    Rsdt { addr: usize, header: &'static SdtHeader },
    Xsdt { addr: usize, header: &'static SdtHeader },
}

impl RootTable {
    /// # Safety
    /// `addr` must point to a mapped, valid RSDT or XSDT.
    pub unsafe fn parse(addr: usize, is_xsdt: bool) -> CoreResult<RootTable> {
        let header = SdtHeader::from_addr(addr);
        header.validate_checksum()?;
        Ok(if is_xsdt {
            RootTable::Xsdt { addr, header }
        } else {
            RootTable::Rsdt { addr, header }
        })
    }

    /// Physical addresses of every child SDT, uniformly as `u64` regardless
    /// of whether the underlying array held 32- or 64-bit pointers.
    pub fn child_addresses(&self) -> ChildAddresses {
        match *self {
            RootTable::Rsdt { addr, header } => {
                let entries_addr = addr + core::mem::size_of::<SdtHeader>();
                let count = (header.length as usize - core::mem::size_of::<SdtHeader>()) / 4;
                ChildAddresses::Narrow { base: entries_addr, count, index: 0 }
            }
            RootTable::Xsdt { addr, header } => {
                let entries_addr = addr + core::mem::size_of::<SdtHeader>();
                let count = (header.length as usize - core::mem::size_of::<SdtHeader>()) / 8;
                ChildAddresses::Wide { base: entries_addr, count, index: 0 }
            }
        }
    }
}

pub enum ChildAddresses {
    Narrow { base: usize, count: usize, index: usize },
    Wide { base: usize, count: usize, index: usize },
}

impl Iterator for ChildAddresses {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            ChildAddresses::Narrow { base, count, index } => {
                if *index >= *count {
                    return None;
                }
                // SAFETY: `base..base + count*4` is within the RSDT, which
                // the caller already validated as mapped and checksummed.
                let ptr = unsafe { ((*base + *index * 4) as *const u32).read_unaligned() };
                *index += 1;
                Some(ptr as usize)
            }
            ChildAddresses::Wide { base, count, index } => {
                if *index >= *count {
                    return None;
                }
                let ptr = unsafe { ((*base + *index * 8) as *const u64).read_unaligned() };
                *index += 1;
                Some(ptr as usize)
            }
        }
    }
}
