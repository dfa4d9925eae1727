//! The virtual memory map manager (C4): one singleton kernel map, plus a
//! per-process map for every other address space.
//!
//! Every table is a plain array of 64-bit entries, accessed through the
//! physical aperture the kernel map itself establishes rather than through
//! a recursive self-mapping -- once the aperture exists, any frame's
//! contents are just `PHYSICAL_APERTURE_BASE + frame.physical_address()`
//! away, so the tree can be walked without a dedicated recursive slot.

#![no_std]

extern crate alloc;

use core_error::{CoreError, CoreResult};
use frame_allocator::{AcquireFlags, FrameAllocator, FrameType, ReleaseFlags};
use irq_safety::MutexIrqSafe;
use kernel_config::memory::{ENTRIES_PER_TABLE, PAGE_SHIFT, PAGE_SIZE, PHYSICAL_APERTURE_BASE};
use memory_structs::{FrameId, MapFlags, ProcessId, VirtualAddress};

bitflags::bitflags! {
    struct PteBits: u64 {
        const PRESENT     = 1 << 0;
        const WRITABLE    = 1 << 1;
        const USER        = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE    = 1 << 4;
        const ACCESSED    = 1 << 5;
        const DIRTY       = 1 << 6;
        const HUGE_PAGE   = 1 << 7;
        const GLOBAL      = 1 << 8;
        const NO_EXECUTE  = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

fn to_pte_bits(flags: MapFlags) -> PteBits {
    let mut bits = PteBits::PRESENT | PteBits::WRITABLE;
    if flags.contains(MapFlags::READ_ONLY) {
        bits.remove(PteBits::WRITABLE);
    }
    if flags.contains(MapFlags::NO_EXEC) {
        bits |= PteBits::NO_EXECUTE;
    }
    if flags.contains(MapFlags::GLOBAL) {
        bits |= PteBits::GLOBAL;
    }
    if flags.contains(MapFlags::NO_CACHE) {
        bits |= PteBits::NO_CACHE;
    }
    if !flags.contains(MapFlags::KERNEL_ONLY) {
        bits |= PteBits::USER;
    }
    if flags.contains(MapFlags::HUGE_PAGE) {
        bits |= PteBits::HUGE_PAGE;
    }
    bits
}

fn from_pte_bits(bits: PteBits) -> MapFlags {
    let mut flags = MapFlags::empty();
    if !bits.contains(PteBits::WRITABLE) {
        flags |= MapFlags::READ_ONLY;
    }
    if bits.contains(PteBits::NO_EXECUTE) {
        flags |= MapFlags::NO_EXEC;
    }
    if bits.contains(PteBits::GLOBAL) {
        flags |= MapFlags::GLOBAL;
    }
    if bits.contains(PteBits::NO_CACHE) {
        flags |= MapFlags::NO_CACHE;
    }
    if !bits.contains(PteBits::USER) {
        flags |= MapFlags::KERNEL_ONLY;
    }
    if bits.contains(PteBits::HUGE_PAGE) {
        flags |= MapFlags::HUGE_PAGE;
    }
    flags
}

/// A raw pointer to the 512-entry table living in frame `frame`, reached
/// through the physical aperture.
fn table_ptr(frame: FrameId) -> *mut u64 {
    (PHYSICAL_APERTURE_BASE + frame.physical_address()) as *mut u64
}

fn index(vaddr: VirtualAddress, level: u8) -> usize {
    let shift = PAGE_SHIFT + 9 * level as usize;
    (vaddr.value() >> shift) & (ENTRIES_PER_TABLE - 1)
}

/// One page map: the kernel map (a singleton, built once at boot) or a
/// per-process map.
pub struct MemoryMap {
    lock: MutexIrqSafe<()>,
    owner_process: ProcessId,
    root: FrameId,
    is_kernel: bool,
}

impl MemoryMap {
    /// Allocates a fresh, zeroed PML4 frame and returns an empty map owned
    /// by `owner`.
    pub fn new_process_map(allocator: &FrameAllocator, owner: ProcessId) -> CoreResult<MemoryMap> {
        let root = allocator
            .acquire(1, AcquireFlags::CLEAR, owner, FrameType::PageTable)?
            .into_iter()
            .next()
            .expect("acquire(1, ..) returned an empty vec");
        Ok(MemoryMap { lock: MutexIrqSafe::new(()), owner_process: owner, root, is_kernel: false })
    }

    /// Builds the kernel's singleton map: every `regions` physical range is
    /// mapped into the physical aperture with 2 MiB huge pages, plus
    /// `framebuffer_range` (mapped uncached, since it's an MMIO-backed
    /// range regardless of how the bootloader's memory map classified the
    /// rest of physical memory around it). After this call the low half of
    /// the root table (the UEFI identity mappings) is cleared -- any
    /// component that cached a low-half pointer must already have
    /// re-pointed itself into the aperture.
    pub fn new_kernel_map(
        allocator: &FrameAllocator,
        present_ranges: &[(FrameId, usize)],
        framebuffer_range: Option<(FrameId, usize)>,
    ) -> CoreResult<MemoryMap> {
        let root = allocator
            .acquire(1, AcquireFlags::CLEAR, ProcessId::KERNEL, FrameType::PageTable)?
            .into_iter()
            .next()
            .expect("acquire(1, ..) returned an empty vec");
        let map = MemoryMap { lock: MutexIrqSafe::new(()), owner_process: ProcessId::KERNEL, root, is_kernel: true };

        for &(first_frame, frame_count) in present_ranges {
            map.map_huge_range(allocator, first_frame, frame_count, MapFlags::KERNEL_ONLY)?;
        }
        if let Some((first_frame, frame_count)) = framebuffer_range {
            map.map_huge_range(allocator, first_frame, frame_count, MapFlags::KERNEL_ONLY | MapFlags::NO_CACHE)?;
        }

        map.clear_low_half();
        Ok(map)
    }

    /// Maps `frame_count` frames starting at `first_frame` into the
    /// physical aperture as consecutive 2 MiB huge pages.
    fn map_huge_range(&self, allocator: &FrameAllocator, first_frame: FrameId, frame_count: usize, flags: MapFlags) -> CoreResult<()> {
        const HUGE_PAGE_FRAMES: usize = (2 * 1024 * 1024) / PAGE_SIZE;
        let mut offset = 0usize;
        while offset < frame_count {
            let huge_frame = FrameId::new(first_frame.0 + offset);
            let vaddr = VirtualAddress::new_canonical(PHYSICAL_APERTURE_BASE + huge_frame.physical_address());
            self.map_huge(allocator, vaddr, huge_frame, flags)?;
            offset += HUGE_PAGE_FRAMES;
        }
        Ok(())
    }

    fn clear_low_half(&self) {
        let _guard = self.lock.lock();
        let pml4 = table_ptr(self.root);
        for i in 0..(ENTRIES_PER_TABLE / 2) {
            unsafe { pml4.add(i).write(0) };
        }
    }

    fn walk_or_create(&self, allocator: &FrameAllocator, vaddr: VirtualAddress, levels: u8) -> CoreResult<*mut u64> {
        let mut table = self.root;
        for level in (levels..4).rev() {
            let ptr = table_ptr(table);
            let idx = index(vaddr, level);
            let entry = unsafe { ptr.add(idx).read() };
            let bits = PteBits::from_bits_truncate(entry);
            if bits.contains(PteBits::PRESENT) {
                table = FrameId::from_physical_address((entry & ADDR_MASK) as usize);
            } else {
                let new_table = allocator
                    .acquire(1, AcquireFlags::CLEAR, self.owner_process, FrameType::PageTable)?
                    .into_iter()
                    .next()
                    .expect("acquire(1, ..) returned an empty vec");
                let new_entry = (new_table.physical_address() as u64 & ADDR_MASK)
                    | (PteBits::PRESENT | PteBits::WRITABLE | PteBits::USER).bits();
                unsafe { ptr.add(idx).write(new_entry) };
                table = new_table;
            }
        }
        let ptr = table_ptr(table);
        Ok(unsafe { ptr.add(index(vaddr, levels)) })
    }

    fn map_huge(&self, allocator: &FrameAllocator, vaddr: VirtualAddress, frame: FrameId, flags: MapFlags) -> CoreResult<()> {
        let _guard = self.lock.lock();
        let entry_ptr = self.walk_or_create(allocator, vaddr, 1)?; // stop at PDT level
        let bits = to_pte_bits(flags | MapFlags::HUGE_PAGE);
        let entry = (frame.physical_address() as u64 & ADDR_MASK) | bits.bits();
        unsafe { entry_ptr.write(entry) };
        Ok(())
    }

    /// Maps a single 4 KiB page. `vaddr` must be page-aligned. If the leaf
    /// is already present and `overwrite_out` is `None`, fails; if
    /// `Some`, the previous frame id is written there and the mapping is
    /// replaced.
    pub fn add(
        &self,
        allocator: &FrameAllocator,
        vaddr: VirtualAddress,
        frame: FrameId,
        flags: MapFlags,
        overwrite_out: Option<&mut FrameId>,
    ) -> CoreResult<()> {
        if !vaddr.is_page_aligned() {
            return Err(CoreError::Unaligned);
        }
        let _guard = self.lock.lock();
        let entry_ptr = self.walk_or_create(allocator, vaddr, 0)?;
        let existing = unsafe { entry_ptr.read() };
        let existing_bits = PteBits::from_bits_truncate(existing);
        if existing_bits.contains(PteBits::PRESENT) {
            match overwrite_out {
                Some(out) => *out = FrameId::from_physical_address((existing & ADDR_MASK) as usize),
                None => return Err(CoreError::InvalidProcess),
            }
        }
        let bits = to_pte_bits(flags);
        let entry = (frame.physical_address() as u64 & ADDR_MASK) | bits.bits();
        unsafe { entry_ptr.write(entry) };
        Ok(())
    }

    /// Clears the leaf and, for each enclosing table level whose every
    /// entry is now empty, frees that table's frame and clears the
    /// parent's entry pointing at it.
    pub fn remove(&self, allocator: &FrameAllocator) -> RemoveOp<'_> {
        RemoveOp { map: self, allocator }
    }

    pub fn translate(&self, vaddr: VirtualAddress) -> Option<(usize, MapFlags)> {
        let _guard = self.lock.lock();
        translate_locked(self.root, vaddr)
    }

    /// Linear scan of the four-level tree for the leaf mapping `frame`.
    /// Huge-page leaves are skipped -- a huge page's frame id never equals
    /// the 4 KiB frame id a caller of `search` is looking for, since the
    /// two live in disjoint id spaces (huge-page entries store a 2 MiB-
    /// aligned physical address, not a `FrameId`-granularity one).
    pub fn search(&self, frame: FrameId) -> Option<(VirtualAddress, MapFlags)> {
        let _guard = self.lock.lock();
        search_subtree(self.root, 3, 0, frame)
    }

    /// Copies the single leaf mapping at `src_vaddr` in `self` to
    /// `dst_vaddr` in `dst`, preserving flags. Fails if `dst_vaddr` is
    /// already mapped in `dst`. Locks are taken in address order (lowest
    /// `lock_order_key` first) so two concurrent copies in opposite
    /// directions between the same pair of maps can't deadlock.
    pub fn copy(
        &self,
        dst: &MemoryMap,
        allocator: &FrameAllocator,
        src_vaddr: VirtualAddress,
        dst_vaddr: VirtualAddress,
    ) -> CoreResult<()> {
        if !dst_vaddr.is_page_aligned() {
            return Err(CoreError::Unaligned);
        }
        let (src_key, dst_key) = (self.root.0, dst.root.0);
        let (_first, _second) = if src_key <= dst_key {
            (self.lock.lock(), dst.lock.lock())
        } else {
            (dst.lock.lock(), self.lock.lock())
        };

        let (paddr, flags) = translate_locked(self.root, src_vaddr).ok_or(CoreError::InvalidProcess)?;
        if flags.contains(MapFlags::HUGE_PAGE) {
            // `copy` moves a single 4 KiB leaf; a huge-page source has no
            // well-defined single destination frame to hand to `dst`.
            return Err(CoreError::InvalidProcess);
        }
        let frame = FrameId::from_physical_address(paddr);
        let entry_ptr = dst.walk_or_create(allocator, dst_vaddr, 0)?;
        let existing = unsafe { entry_ptr.read() };
        if PteBits::from_bits_truncate(existing).contains(PteBits::PRESENT) {
            return Err(CoreError::InvalidProcess);
        }
        let bits = to_pte_bits(flags);
        let entry = (frame.physical_address() as u64 & ADDR_MASK) | bits.bits();
        unsafe { entry_ptr.write(entry) };
        Ok(())
    }

    /// Bulk form of [`Self::copy`]: copies every present leaf in
    /// `[begin, end)` (page-aligned, exclusive of `end`) into `dst`
    /// starting at `begin`. Atomic all-or-nothing relative to any new
    /// intermediate table `dst` had to create: on a failure partway
    /// through, every leaf already copied this call is removed from
    /// `dst` (and any table frame that copy created is freed) before the
    /// error is returned, leaving `dst` exactly as it was before the call.
    pub fn copy_range(
        &self,
        dst: &MemoryMap,
        allocator: &FrameAllocator,
        begin: VirtualAddress,
        end: VirtualAddress,
    ) -> CoreResult<()> {
        if !begin.is_page_aligned() || !end.is_page_aligned() || end.value() < begin.value() {
            return Err(CoreError::Unaligned);
        }
        let mut copied = alloc::vec::Vec::new();
        let mut vaddr = begin.value();
        while vaddr < end.value() {
            let v = VirtualAddress::new_canonical(vaddr);
            match self.copy(dst, allocator, v, v) {
                Ok(()) => copied.push(v),
                Err(e) => {
                    for done in copied {
                        let _ = dst.remove(allocator).at(done);
                    }
                    return Err(e);
                }
            }
            vaddr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Frees every frame reachable from the root, then the root itself.
    /// Refuses to act on the kernel map.
    pub fn destroy(self, allocator: &FrameAllocator) -> CoreResult<()> {
        if self.is_kernel {
            return Err(CoreError::InvalidProcess);
        }
        let owner = self.owner_process;
        destroy_subtree(self.root, 3, owner, allocator);
        allocator.release_strict(&[self.root], owner, ReleaseFlags::empty())?;
        Ok(())
    }
}

/// The lock-free core of [`MemoryMap::translate`], reused by [`MemoryMap::copy`]
/// which already holds both maps' locks and can't re-take one of them.
fn translate_locked(root: FrameId, vaddr: VirtualAddress) -> Option<(usize, MapFlags)> {
    let mut table = root;
    for level in (0..4).rev() {
        let ptr = table_ptr(table);
        let idx = index(vaddr, level);
        let entry = unsafe { ptr.add(idx).read() };
        let bits = PteBits::from_bits_truncate(entry);
        if !bits.contains(PteBits::PRESENT) {
            return None;
        }
        if level == 1 && bits.contains(PteBits::HUGE_PAGE) {
            let base = (entry & ADDR_MASK) as usize;
            let huge_offset = vaddr.value() & ((2 * 1024 * 1024) - 1);
            return Some((base + huge_offset, from_pte_bits(bits)));
        }
        if level == 0 {
            return Some(((entry & ADDR_MASK) as usize, from_pte_bits(bits)));
        }
        table = FrameId::from_physical_address((entry & ADDR_MASK) as usize);
    }
    None
}

fn search_subtree(frame: FrameId, level: u8, vaddr_prefix: usize, target: FrameId) -> Option<(VirtualAddress, MapFlags)> {
    let ptr = table_ptr(frame);
    for i in 0..ENTRIES_PER_TABLE {
        let entry = unsafe { ptr.add(i).read() };
        let bits = PteBits::from_bits_truncate(entry);
        if !bits.contains(PteBits::PRESENT) {
            continue;
        }
        let prefix = vaddr_prefix | (i << (PAGE_SHIFT + 9 * level as usize));
        if level == 0 {
            let leaf = FrameId::from_physical_address((entry & ADDR_MASK) as usize);
            if leaf == target {
                return Some((VirtualAddress::new_canonical(prefix), from_pte_bits(bits)));
            }
            continue;
        }
        if bits.contains(PteBits::HUGE_PAGE) {
            // Huge-page leaves live at level 1 but describe 2 MiB frames,
            // a different id space than the 4 KiB `target` callers search
            // for; skip them per spec.md §4.3.
            continue;
        }
        let child = FrameId::from_physical_address((entry & ADDR_MASK) as usize);
        if let Some(found) = search_subtree(child, level - 1, prefix, target) {
            return Some(found);
        }
    }
    None
}

fn destroy_subtree(frame: FrameId, level: u8, owner: ProcessId, allocator: &FrameAllocator) {
    let ptr = table_ptr(frame);
    for i in 0..ENTRIES_PER_TABLE {
        let entry = unsafe { ptr.add(i).read() };
        let bits = PteBits::from_bits_truncate(entry);
        if !bits.contains(PteBits::PRESENT) {
            continue;
        }
        let child = FrameId::from_physical_address((entry & ADDR_MASK) as usize);
        if level == 0 || bits.contains(PteBits::HUGE_PAGE) {
            // A level-0 entry is a leaf data frame; a huge-page entry at
            // level 1 is also a leaf (a 2 MiB data frame, not a table) --
            // neither has a subtree to recurse into, just a frame to free.
            let _ = allocator.release_strict(&[child], owner, ReleaseFlags::empty());
            continue;
        }
        destroy_subtree(child, level - 1, owner, allocator);
        let _ = allocator.release_strict(&[child], owner, ReleaseFlags::empty());
    }
}

pub struct RemoveOp<'a> {
    map: &'a MemoryMap,
    allocator: &'a FrameAllocator,
}

impl<'a> RemoveOp<'a> {
    pub fn at(self, vaddr: VirtualAddress) -> CoreResult<FrameId> {
        let _guard = self.map.lock.lock();
        let mut path = [FrameId::NULL; 4];
        let mut table = self.map.root;
        for level in (0..4).rev() {
            path[level as usize] = table;
            let ptr = table_ptr(table);
            let idx = index(vaddr, level);
            let entry = unsafe { ptr.add(idx).read() };
            let bits = PteBits::from_bits_truncate(entry);
            if !bits.contains(PteBits::PRESENT) {
                return Err(CoreError::InvalidProcess);
            }
            if level != 0 {
                table = FrameId::from_physical_address((entry & ADDR_MASK) as usize);
            }
        }

        let leaf_table = table;
        let leaf_ptr = table_ptr(leaf_table);
        let leaf_idx = index(vaddr, 0);
        let leaf_entry = unsafe { leaf_ptr.add(leaf_idx).read() };
        let leaf_frame = FrameId::from_physical_address((leaf_entry & ADDR_MASK) as usize);
        unsafe { leaf_ptr.add(leaf_idx).write(0) };

        // Walk back up, freeing any now-empty intermediate table.
        let mut child = leaf_table;
        for level in 1..4 {
            let parent = path[level as usize];
            let parent_ptr = table_ptr(parent);
            if table_is_empty(child) {
                let parent_idx = index(vaddr, level);
                unsafe { parent_ptr.add(parent_idx).write(0) };
                let _ = self.allocator.release_strict(&[child], self.map.owner_process, ReleaseFlags::empty());
            } else {
                break;
            }
            child = parent;
        }

        self.allocator.release_strict(&[leaf_frame], self.map.owner_process, ReleaseFlags::empty())?;
        Ok(leaf_frame)
    }
}

fn table_is_empty(frame: FrameId) -> bool {
    let ptr = table_ptr(frame);
    (0..ENTRIES_PER_TABLE).all(|i| unsafe { ptr.add(i).read() } == 0)
}

/// An address-derived key callers use to take two maps' locks in a fixed
/// order when operating on both concurrently (never in reverse).
pub fn lock_order_key(map: &MemoryMap) -> usize {
    map.root.0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_picks_out_the_right_nine_bits_per_level() {
        // PML4[1] -> PDPT[2] -> PDT[3] -> PT[4]
        let vaddr = VirtualAddress::new_canonical((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12));
        assert_eq!(index(vaddr, 3), 1);
        assert_eq!(index(vaddr, 2), 2);
        assert_eq!(index(vaddr, 1), 3);
        assert_eq!(index(vaddr, 0), 4);
    }

    #[test]
    fn map_flags_round_trip_through_pte_bits() {
        for flags in [
            MapFlags::empty(),
            MapFlags::READ_ONLY,
            MapFlags::NO_EXEC,
            MapFlags::GLOBAL | MapFlags::NO_CACHE,
            MapFlags::READ_ONLY | MapFlags::KERNEL_ONLY | MapFlags::NO_EXEC,
        ] {
            let bits = to_pte_bits(flags);
            assert_eq!(from_pte_bits(bits), flags);
        }
    }

    #[test]
    fn read_only_inverts_the_writable_bit() {
        assert!(to_pte_bits(MapFlags::empty()).contains(PteBits::WRITABLE));
        assert!(!to_pte_bits(MapFlags::READ_ONLY).contains(PteBits::WRITABLE));
    }

    #[test]
    fn kernel_only_is_the_absence_of_the_user_bit() {
        assert!(!to_pte_bits(MapFlags::KERNEL_ONLY).contains(PteBits::USER));
        assert!(to_pte_bits(MapFlags::empty()).contains(PteBits::USER));
    }

    #[test]
    fn addr_mask_strips_flag_bits_from_a_raw_entry() {
        let entry = 0x0000_0000_1234_5000u64 | (PteBits::PRESENT | PteBits::WRITABLE).bits();
        assert_eq!(entry & ADDR_MASK, 0x0000_0000_1234_5000);
    }
}
