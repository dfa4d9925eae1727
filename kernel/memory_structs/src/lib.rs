//! Address, frame and flag newtypes shared by the page allocator, the
//! virtual map manager, and the kernel heap.

#![no_std]

use core::fmt;
use derive_more::{Add, AddAssign, Sub, SubAssign};
use kernel_config::memory::{NULL_FRAME, PAGE_SHIFT, PAGE_SIZE, VIRTUAL_ADDRESS_BITS};

/// Identifies a 4 KiB physical page by index; physical address = `id * 4096`.
/// Frame 0 is the null sentinel and is never handed out by the allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, AddAssign, Sub, SubAssign)]
pub struct FrameId(pub usize);

impl FrameId {
    pub const NULL: FrameId = FrameId(NULL_FRAME);

    pub const fn new(id: usize) -> FrameId {
        FrameId(id)
    }

    pub const fn from_physical_address(paddr: usize) -> FrameId {
        FrameId(paddr >> PAGE_SHIFT)
    }

    pub const fn physical_address(self) -> usize {
        self.0 << PAGE_SHIFT
    }

    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame({:#x})", self.0)
    }
}

/// 24-bit opaque process identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Reserved: the kernel itself, owner of global structures.
    pub const KERNEL: ProcessId = ProcessId(0x00_FFFF);
    /// Reserved: marks a frame/handler/line as unowned.
    pub const INVALID: ProcessId = ProcessId(0xFF_FFFF);

    pub const fn new(id: u32) -> Option<ProcessId> {
        if id <= 0xFF_FFFF {
            Some(ProcessId(id))
        } else {
            None
        }
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// 48-bit canonical virtual address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub fn new(addr: usize) -> Option<VirtualAddress> {
        let shift = usize::BITS - VIRTUAL_ADDRESS_BITS;
        let top = (addr as isize) << shift >> shift;
        if top as usize == addr {
            Some(VirtualAddress(addr))
        } else {
            None
        }
    }

    /// Truncates to a canonical address by sign-extending bit 47, the way
    /// the recursive-mapping and heap-growth call sites construct one from
    /// an index arithmetic result that is already known to be in range.
    pub const fn new_canonical(addr: usize) -> VirtualAddress {
        let shift = usize::BITS - VIRTUAL_ADDRESS_BITS;
        VirtualAddress(((addr as isize) << shift >> shift) as usize)
    }

    pub const fn value(self) -> usize {
        self.0
    }

    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub const fn align_down(self) -> VirtualAddress {
        VirtualAddress(self.0 & !(PAGE_SIZE - 1))
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{:#x}", self.0)
    }
}

bitflags::bitflags! {
    /// Architecture-neutral flags for a [`crate::VirtualAddress`] -> [`FrameId`]
    /// translation entry. Translated to x86-64 page-table-entry bits by the
    /// virtual map manager (`ReadOnly` is inverted into the `WRITABLE` PTE
    /// bit, `NoExec` maps onto `NO_EXECUTE`, and so on).
    #[derive(Default)]
    pub struct MapFlags: u32 {
        const READ_ONLY   = 1 << 0;
        const NO_EXEC     = 1 << 1;
        const GLOBAL      = 1 << 2;
        const NO_CACHE    = 1 << 3;
        const KERNEL_ONLY = 1 << 4;
        const HUGE_PAGE   = 1 << 5;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_id_physical_address_round_trips() {
        let frame = FrameId::new(12345);
        assert_eq!(FrameId::from_physical_address(frame.physical_address()), frame);
        assert_eq!(frame.physical_address(), 12345 * PAGE_SIZE);
    }

    #[test]
    fn frame_zero_is_the_null_sentinel() {
        assert!(FrameId::new(0).is_null());
        assert_eq!(FrameId::NULL, FrameId::new(0));
    }

    #[test]
    fn process_id_rejects_values_above_24_bits() {
        assert!(ProcessId::new(0xFF_FFFE).is_some());
        assert!(ProcessId::new(0x1_00_0000).is_none());
        assert!(!ProcessId::KERNEL.is_invalid());
        assert!(ProcessId::INVALID.is_invalid());
    }

    #[test]
    fn virtual_address_rejects_non_canonical_values() {
        // Bit 47 set but not sign-extended through the top 16 bits: not canonical.
        assert!(VirtualAddress::new(0x0000_8000_0000_0000).is_none());
        // Properly sign-extended kernel-half address: canonical.
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_some());
        // Low-half address: always canonical.
        assert!(VirtualAddress::new(0x1000).is_some());
    }

    #[test]
    fn virtual_address_page_alignment() {
        let aligned = VirtualAddress::new(0xFFFF_8000_0000_1000).unwrap();
        assert!(aligned.is_page_aligned());
        let unaligned = VirtualAddress::new(0xFFFF_8000_0000_1001).unwrap();
        assert!(!unaligned.is_page_aligned());
        assert_eq!(unaligned.align_down(), aligned);
    }

    #[test]
    fn map_flags_read_only_and_no_exec_are_independent_bits() {
        let flags = MapFlags::READ_ONLY | MapFlags::NO_EXEC;
        assert!(flags.contains(MapFlags::READ_ONLY));
        assert!(flags.contains(MapFlags::NO_EXEC));
        assert!(!flags.contains(MapFlags::GLOBAL));
    }
}
