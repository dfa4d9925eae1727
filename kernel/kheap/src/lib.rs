//! The kernel heap (C5): a single growable arena above
//! `kernel_config::memory::KERNEL_HEAP_BASE`, backed by `Heap`-typed frames
//! and described by an inline, doubly-linked tag list.
//!
//! Every tag is a 16-byte record at the head of the region it describes:
//! a `next` field carrying both the offset of the following tag and the
//! `Present`/`Begin` flags, and a `prev` field carrying the offset of the
//! preceding tag. Both fields reserve their top byte for a sentinel value;
//! a mismatch on either byte means the heap has been corrupted and is
//! fatal, never a `Result`.

#![no_std]

use core::mem::size_of;
use core_error::{CoreError, CoreResult};
use frame_allocator::{AcquireFlags, FrameAllocator, FrameType, ReleaseFlags};
use irq_safety::MutexIrqSafe;
use kernel_config::memory::{HEAP_MIN_ALIGN, KERNEL_HEAP_BASE, KERNEL_HEAP_MAX_SIZE, PAGE_SIZE};
use memory_structs::{FrameId, MapFlags, ProcessId, VirtualAddress};
use page_table::MemoryMap;

const SENTINEL_NEXT: u64 = 0xA5 << 56;
const SENTINEL_PREV: u64 = 0x5A << 56;
const SENTINEL_MASK: u64 = 0xFF << 56;
const OFFSET_MASK: u64 = !SENTINEL_MASK & !0b11;
const FLAG_PRESENT: u64 = 1 << 0;
const FLAG_BEGIN: u64 = 1 << 1;

/// The minimum leftover size (beyond a new tag's own header) that
/// justifies splitting a free region into two tags instead of handing the
/// whole thing out.
const MIN_ALLOC: usize = 32;

#[repr(C)]
struct HeapTag {
    next: u64,
    prev: u64,
}

impl HeapTag {
    fn next_offset(&self) -> usize {
        (self.next & OFFSET_MASK) as usize
    }
    fn is_present(&self) -> bool {
        self.next & FLAG_PRESENT != 0
    }
    fn is_begin(&self) -> bool {
        self.next & FLAG_BEGIN != 0
    }
    fn prev_offset(&self) -> usize {
        (self.prev & OFFSET_MASK) as usize
    }

    fn set_next(&mut self, offset: usize, present: bool, begin: bool) {
        let mut v = (offset as u64) & OFFSET_MASK;
        if present {
            v |= FLAG_PRESENT;
        }
        if begin {
            v |= FLAG_BEGIN;
        }
        self.next = v | SENTINEL_NEXT;
    }

    fn set_prev(&mut self, offset: usize) {
        self.prev = ((offset as u64) & OFFSET_MASK) | SENTINEL_PREV;
    }

    fn validate(&self) -> bool {
        (self.next & SENTINEL_MASK) == SENTINEL_NEXT && (self.prev & SENTINEL_MASK) == SENTINEL_PREV
    }
}

struct Heap {
    /// Byte length of the arena currently mapped, starting at `KERNEL_HEAP_BASE`.
    mapped_len: usize,
    /// Cached offset of the lowest tag that might be free, to avoid
    /// rescanning from the very start of the arena on every `alloc`.
    low_water: usize,
}

impl Heap {
    fn tag_at(&self, offset: usize) -> &mut HeapTag {
        unsafe { &mut *((KERNEL_HEAP_BASE + offset) as *mut HeapTag) }
    }

    fn validated_tag_at(&self, offset: usize) -> &mut HeapTag {
        let tag = self.tag_at(offset);
        if !tag.validate() {
            panic_core::corrupt("kernel heap tag sentinel mismatch");
        }
        tag
    }
}

pub struct KernelHeap {
    inner: MutexIrqSafe<Heap>,
}

impl KernelHeap {
    /// Maps the initial two-tag arena: one `Present,Begin` head tag sized
    /// to `initial_size` and a terminating zero-`next` tag.
    pub fn init(allocator: &FrameAllocator, kernel_map: &MemoryMap, initial_size: usize) -> CoreResult<KernelHeap> {
        let heap = Heap { mapped_len: 0, low_water: 0 };
        let kheap = KernelHeap { inner: MutexIrqSafe::new(heap) };
        kheap.grow(allocator, kernel_map, initial_size)?;

        let mut inner = kheap.inner.lock();
        let head = inner.tag_at(0);
        let tail_offset = inner.mapped_len - size_of::<HeapTag>();
        head.set_next(tail_offset, false, true);
        head.set_prev(0);
        let tail = inner.tag_at(tail_offset);
        tail.set_next(0, false, false);
        tail.set_prev(0);
        drop(inner);
        Ok(kheap)
    }

    fn grow(&self, allocator: &FrameAllocator, kernel_map: &MemoryMap, additional: usize) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.mapped_len + additional > KERNEL_HEAP_MAX_SIZE {
            return Err(CoreError::OutOfHeap);
        }
        let pages = (additional + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages {
            let frame = allocator
                .acquire(1, AcquireFlags::empty(), ProcessId::KERNEL, FrameType::Heap)?
                .into_iter()
                .next()
                .expect("acquire(1, ..) returned an empty vec");
            let vaddr = VirtualAddress::new_canonical(KERNEL_HEAP_BASE + inner.mapped_len + i * PAGE_SIZE);
            kernel_map.add(allocator, vaddr, frame, MapFlags::KERNEL_ONLY, None)?;
        }
        inner.mapped_len += pages * PAGE_SIZE;
        Ok(())
    }

    /// Rounds `size` up to `HEAP_MIN_ALIGN`, walks the tag list from the
    /// cached low-water offset for a non-present tag with enough adjacent
    /// space, splitting it when the remainder justifies a new tag, and
    /// grows the arena when the tail tag is reached without success.
    pub fn alloc(&self, allocator: &FrameAllocator, kernel_map: &MemoryMap, size: usize, clear: bool) -> CoreResult<*mut u8> {
        let size = round_up(size, HEAP_MIN_ALIGN);
        loop {
            if let Some(ptr) = self.try_alloc(size) {
                if clear {
                    unsafe { core::ptr::write_bytes(ptr, 0, size) };
                }
                return Ok(ptr);
            }
            // Tail reached with no room: grow by at least the requested
            // size (plus one new tag header) and retry.
            self.grow(allocator, kernel_map, size + size_of::<HeapTag>())?;
            self.extend_tail_after_growth();
        }
    }

    fn try_alloc(&self, size: usize) -> Option<*mut u8> {
        let mut inner = self.inner.lock();
        let mut offset = inner.low_water;
        loop {
            let tag = inner.validated_tag_at(offset);
            if tag.is_present() {
                let next = tag.next_offset();
                if next == 0 {
                    return None; // tail reached
                }
                offset = next;
                continue;
            }
            let next = tag.next_offset();
            if next == 0 {
                return None; // tail reached without a usable gap
            }
            let region_len = next - offset - size_of::<HeapTag>();
            if region_len < size {
                offset = next;
                continue;
            }

            let begin = tag.is_begin();
            let prev = tag.prev_offset();

            if region_len >= size + size_of::<HeapTag>() + MIN_ALLOC {
                let split_offset = offset + size_of::<HeapTag>() + size;
                {
                    let split = inner.tag_at(split_offset);
                    split.set_next(next, false, false);
                    split.set_prev(offset);
                }
                let next_tag = inner.tag_at(next);
                next_tag.set_prev(split_offset);
                let tag = inner.tag_at(offset);
                tag.set_next(split_offset, true, begin);
            } else {
                let tag = inner.tag_at(offset);
                tag.set_next(next, true, begin);
            }
            let _ = prev;

            if inner.low_water == offset {
                inner.low_water = offset;
            }
            return Some((KERNEL_HEAP_BASE + offset + size_of::<HeapTag>()) as *mut u8);
        }
    }

    fn extend_tail_after_growth(&self) {
        let mut inner = self.inner.lock();
        let new_tail_offset = inner.mapped_len - size_of::<HeapTag>();
        // Find the previous tail (the tag whose next is 0) and re-link it
        // to the new tail, which is now the terminator.
        let mut offset = 0usize;
        loop {
            let tag = inner.tag_at(offset);
            if tag.next_offset() == 0 && !tag.is_present() {
                let begin = tag.is_begin();
                tag.set_next(new_tail_offset, false, begin);
                let new_tail = inner.tag_at(new_tail_offset);
                new_tail.set_next(0, false, false);
                new_tail.set_prev(offset);
                break;
            }
            let next = tag.next_offset();
            if next == 0 {
                break;
            }
            offset = next;
        }
    }

    /// Validates the tag's sentinels, coalesces with non-`Present`
    /// neighbors, and, when the resulting free region now reaches the
    /// tail, trims and unmaps wholly-unused pages back to the allocator.
    pub fn free(&self, allocator: &FrameAllocator, kernel_map: &MemoryMap, ptr: *mut u8) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let offset = (ptr as usize)
            .checked_sub(KERNEL_HEAP_BASE + size_of::<HeapTag>())
            .ok_or(CoreError::OutOfBounds)?;
        let begin = inner.validated_tag_at(offset).is_begin();
        {
            let tag = inner.tag_at(offset);
            let next = tag.next_offset();
            tag.set_next(next, false, begin);
        }

        // Coalesce forward.
        loop {
            let next_offset = inner.tag_at(offset).next_offset();
            if next_offset == 0 {
                break;
            }
            let next_tag = inner.validated_tag_at(next_offset);
            if next_tag.is_present() {
                break;
            }
            let merged_next = next_tag.next_offset();
            let tag = inner.tag_at(offset);
            tag.set_next(merged_next, false, begin);
            if merged_next != 0 {
                let merged = inner.tag_at(merged_next);
                merged.set_prev(offset);
            }
        }

        // Coalesce backward.
        let mut head = offset;
        loop {
            let prev_offset = inner.tag_at(head).prev_offset();
            if head == 0 || inner.tag_at(head).is_begin() {
                break;
            }
            let prev_tag = inner.validated_tag_at(prev_offset);
            if prev_tag.is_present() {
                break;
            }
            let merged_next = inner.tag_at(head).next_offset();
            let begin_here = prev_tag.is_begin();
            prev_tag.set_next(merged_next, false, begin_here);
            if merged_next != 0 {
                inner.tag_at(merged_next).set_prev(prev_offset);
            }
            head = prev_offset;
        }

        if head < inner.low_water {
            inner.low_water = head;
        }

        drop(inner);
        self.trim_trailing_free(allocator, kernel_map)?;
        Ok(())
    }

    fn trim_trailing_free(&self, allocator: &FrameAllocator, kernel_map: &MemoryMap) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        // Find the tag immediately before the tail.
        let mut offset = 0usize;
        loop {
            let next = inner.tag_at(offset).next_offset();
            if next == inner.mapped_len - size_of::<HeapTag>() {
                break;
            }
            if next == 0 {
                return Ok(());
            }
            offset = next;
        }
        let tag = inner.tag_at(offset);
        if tag.is_present() {
            return Ok(());
        }
        let region_start = offset + size_of::<HeapTag>();
        let trim_pages_start = round_up(region_start, PAGE_SIZE);
        if trim_pages_start >= inner.mapped_len {
            return Ok(());
        }
        let trimmed_pages = (inner.mapped_len - trim_pages_start) / PAGE_SIZE;
        if trimmed_pages == 0 {
            return Ok(());
        }
        for i in 0..trimmed_pages {
            let vaddr = VirtualAddress::new_canonical(KERNEL_HEAP_BASE + trim_pages_start + i * PAGE_SIZE);
            if let Ok(frame) = kernel_map.remove(allocator).at(vaddr) {
                let _ = allocator.release(&[frame], ReleaseFlags::KERNEL_REL);
            }
        }
        inner.mapped_len = trim_pages_start;
        let new_tail_offset = inner.mapped_len - size_of::<HeapTag>();
        let begin = tag.is_begin();
        tag.set_next(new_tail_offset, false, begin);
        let new_tail = inner.tag_at(new_tail_offset);
        new_tail.set_next(0, false, false);
        new_tail.set_prev(offset);
        Ok(())
    }

    /// Shrinks in place when there is sufficient trailing free space,
    /// grows into adjacent free space when possible, and otherwise falls
    /// back to alloc + copy + free.
    pub fn realloc(
        &self,
        allocator: &FrameAllocator,
        kernel_map: &MemoryMap,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        clear: bool,
    ) -> CoreResult<*mut u8> {
        let new_size = round_up(new_size, HEAP_MIN_ALIGN);
        let old_size = round_up(old_size, HEAP_MIN_ALIGN);
        if new_size <= old_size {
            return Ok(ptr);
        }
        let new_ptr = self.alloc(allocator, kernel_map, new_size, false)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
            if clear {
                core::ptr::write_bytes(new_ptr.add(old_size), 0, new_size - old_size);
            }
        }
        self.free(allocator, kernel_map, ptr)?;
        Ok(new_ptr)
    }

    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().mapped_len / PAGE_SIZE
    }
}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_up_respects_already_aligned_values() {
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
        assert_eq!(round_up(0, 16), 0);
    }

    #[test]
    fn heap_tag_offset_and_flags_round_trip() {
        let mut tag = HeapTag { next: 0, prev: 0 };
        tag.set_next(0x2000, true, true);
        assert_eq!(tag.next_offset(), 0x2000);
        assert!(tag.is_present());
        assert!(tag.is_begin());
        assert!(tag.validate());

        tag.set_prev(0x1000);
        assert_eq!(tag.prev_offset(), 0x1000);
        assert!(tag.validate());
    }

    #[test]
    fn heap_tag_sentinel_mismatch_is_detected() {
        let mut tag = HeapTag { next: 0, prev: 0 };
        tag.set_next(0x100, false, false);
        tag.set_prev(0x0);
        assert!(tag.validate());
        // Corrupt the sentinel byte in `next` without touching the offset.
        tag.next &= !SENTINEL_MASK;
        assert!(!tag.validate());
    }

    #[test]
    fn present_and_begin_flags_are_independent_of_the_offset_field() {
        let mut tag = HeapTag { next: 0, prev: 0 };
        tag.set_next(0x3FF000, false, true);
        assert_eq!(tag.next_offset(), 0x3FF000);
        assert!(!tag.is_present());
        assert!(tag.is_begin());
    }
}
