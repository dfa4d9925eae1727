//! The physical page allocator (C3): a contiguous, frame-id-indexed table
//! of per-frame owner/state/type records, plus the acquire/lock/release
//! family of operations over it.
//!
//! Unlike a free-list-of-chunks design, every frame's bookkeeping lives
//! inline in the table at a fixed offset -- the layout spec.md requires so
//! that `owner`/`state`/`type` can be inspected or mass-transitioned
//! (`reclaim`) without walking a tree.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::slice;
use core_error::{CoreError, CoreResult};
use irq_safety::MutexIrqSafe;
use kernel_config::memory::{AP_INIT_FRAME, NULL_FRAME, PAGE_SIZE, PHYSICAL_APERTURE_BASE};
use memory_structs::{FrameId, ProcessId};
use static_assertions::const_assert_eq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Reserved = 0,
    Available = 1,
    Locked = 2,
    Acpi = 3,
    Bootloader = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Other = 0,
    PageTable = 1,
    Heap = 2,
    Image = 3,
    Shared = 4,
}

/// 6 bytes on the wire: a 24-bit owner, one state byte, one type byte, and
/// one reserved byte kept for future use / alignment.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FrameRecord {
    owner_lo: u16,
    owner_hi: u8,
    state: u8,
    kind: u8,
    _reserved: u8,
}

const_assert_eq!(core::mem::size_of::<FrameRecord>(), 6);

impl FrameRecord {
    const fn reserved(kind: FrameType) -> FrameRecord {
        FrameRecord {
            owner_lo: 0,
            owner_hi: 0xFF, // high byte of ProcessId::INVALID
            state: FrameState::Reserved as u8,
            kind: kind as u8,
            _reserved: 0,
        }
    }

    fn owner(&self) -> ProcessId {
        let raw = self.owner_lo as u32 | (self.owner_hi as u32) << 16;
        ProcessId::new(raw).unwrap_or(ProcessId::INVALID)
    }

    fn set_owner(&mut self, owner: ProcessId) {
        let raw = owner.as_u32();
        self.owner_lo = raw as u16;
        self.owner_hi = (raw >> 16) as u8;
    }

    fn state(&self) -> FrameState {
        match self.state {
            0 => FrameState::Reserved,
            1 => FrameState::Available,
            2 => FrameState::Locked,
            3 => FrameState::Acpi,
            4 => FrameState::Bootloader,
            _ => FrameState::Reserved,
        }
    }

    fn set_state(&mut self, state: FrameState) {
        self.state = state as u8;
    }

    pub fn kind(&self) -> FrameType {
        match self.kind {
            0 => FrameType::Other,
            1 => FrameType::PageTable,
            2 => FrameType::Heap,
            3 => FrameType::Image,
            4 => FrameType::Shared,
            _ => FrameType::Other,
        }
    }
}

bitflags::bitflags! {
    pub struct AcquireFlags: u32 {
        /// Require the returned frames to be a single consecutive run.
        const CONSECUTIVE  = 1 << 0;
        /// Prefer the highest-addressed run when more than one fits.
        const PREFER_HIGH  = 1 << 1;
        /// Zero-fill the returned frames through the physical aperture.
        const CLEAR        = 1 << 2;
    }
}

bitflags::bitflags! {
    pub struct ReleaseFlags: u32 {
        /// Required to release a frame owned by `ProcessId::KERNEL`.
        const KERNEL_REL = 1 << 0;
    }
}

/// A raw, unsafely-constructed view over the frame-record table. The table
/// itself lives in memory the allocator's own init step carved out of the
/// memory map -- see [`FrameAllocator::init`].
struct Table {
    records: &'static mut [FrameRecord],
}

pub struct FrameAllocator {
    inner: MutexIrqSafe<Table>,
}

/// One entry of the memory map this allocator classifies frames against
/// (the arch-independent shape `boot_params` ingests, narrowed to what C3
/// needs).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub first_frame: FrameId,
    pub frame_count: usize,
    pub kind: RegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Acpi,
    Bootloader,
    Reserved,
}

impl FrameAllocator {
    /// Builds the frame-record table over `table_memory` (a page-aligned,
    /// `total_frames * 6`-byte-or-larger region this function does not
    /// itself carve out of the memory map -- that placement decision, and
    /// not overlapping the returned table with frame 8 or any `regions`
    /// entry, is the caller's responsibility as part of boot sequencing).
    ///
    /// # Safety
    /// `table_memory` must be exclusively owned by the allocator from this
    /// call onward, mapped, and writable for `total_frames` records.
    pub unsafe fn init(
        table_memory: *mut FrameRecord,
        total_frames: usize,
        regions: &[MemoryRegion],
    ) -> FrameAllocator {
        let records = slice::from_raw_parts_mut(table_memory, total_frames);
        for r in records.iter_mut() {
            *r = FrameRecord::reserved(FrameType::Other);
        }

        for region in regions {
            let state = match region.kind {
                RegionKind::Available => FrameState::Available,
                RegionKind::Acpi => FrameState::Acpi,
                RegionKind::Bootloader => FrameState::Bootloader,
                RegionKind::Reserved => FrameState::Reserved,
            };
            let start = region.first_frame.0;
            let end = (start + region.frame_count).min(total_frames);
            for id in start..end {
                records[id].set_state(state);
                records[id].set_owner(ProcessId::INVALID);
            }
        }

        if NULL_FRAME < total_frames {
            records[NULL_FRAME] = FrameRecord::reserved(FrameType::Other);
        }
        if AP_INIT_FRAME < total_frames {
            records[AP_INIT_FRAME] = FrameRecord::reserved(FrameType::Other);
        }

        FrameAllocator { inner: MutexIrqSafe::new(Table { records }) }
    }

    /// Searches for and locks `count` frames, per `flags`. Never returns
    /// frame 0.
    pub fn acquire(&self, count: usize, flags: AcquireFlags, process: ProcessId, kind: FrameType) -> CoreResult<Vec<FrameId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut table = self.inner.lock();

        let run = find_run(&table.records, count, flags.contains(AcquireFlags::PREFER_HIGH));

        let chosen: Vec<usize> = if let Some(start) = run {
            (start..start + count).collect()
        } else if flags.contains(AcquireFlags::CONSECUTIVE) {
            return Err(CoreError::OutOfFrames);
        } else {
            let mut picked = Vec::new();
            let best = find_run(&table.records, 1, flags.contains(AcquireFlags::PREFER_HIGH));
            let mut longest = 0usize;
            let mut longest_start = best;
            // Fall back to the single largest run plus scattered frames.
            let mut i = 0usize;
            while i < table.records.len() {
                if table.records[i].state() == FrameState::Available && i != NULL_FRAME {
                    let mut j = i;
                    while j < table.records.len() && table.records[j].state() == FrameState::Available && j != NULL_FRAME {
                        j += 1;
                    }
                    if j - i > longest {
                        longest = j - i;
                        longest_start = Some(i);
                    }
                    i = j;
                } else {
                    i += 1;
                }
            }
            if let Some(start) = longest_start {
                picked.extend(start..start + longest);
            }
            if picked.len() < count {
                for (idx, rec) in table.records.iter().enumerate() {
                    if picked.len() >= count {
                        break;
                    }
                    if idx != NULL_FRAME && rec.state() == FrameState::Available && !picked.contains(&idx) {
                        picked.push(idx);
                    }
                }
            }
            if picked.len() < count {
                return Err(CoreError::OutOfFrames);
            }
            picked.truncate(count);
            picked
        };

        for &id in &chosen {
            table.records[id].set_state(FrameState::Locked);
            table.records[id].set_owner(process);
            table.records[id].kind = kind as u8;
        }

        let frames: Vec<FrameId> = chosen.into_iter().map(FrameId::new).collect();

        if flags.contains(AcquireFlags::CLEAR) {
            for &frame in &frames {
                clear_frame(frame);
            }
        }

        Ok(frames)
    }

    /// Atomically transitions every frame in `frames` from `Available` to
    /// `Locked(process, kind)`; rejects (leaving all frames untouched) if
    /// any is not `Available`.
    pub fn lock(&self, frames: &[FrameId], process: ProcessId, kind: FrameType) -> CoreResult<()> {
        let mut table = self.inner.lock();
        for f in frames {
            if table.records[f.0].state() != FrameState::Available {
                return Err(CoreError::InvalidProcess);
            }
        }
        for f in frames {
            table.records[f.0].set_state(FrameState::Locked);
            table.records[f.0].set_owner(process);
            table.records[f.0].kind = kind as u8;
        }
        Ok(())
    }

    /// Accepts already-`Available` frames as a no-op. Kernel-owned frames
    /// require `ReleaseFlags::KERNEL_REL`. Validates every frame before
    /// mutating any.
    pub fn release(&self, frames: &[FrameId], flags: ReleaseFlags) -> CoreResult<()> {
        let mut table = self.inner.lock();
        for f in frames {
            match table.records[f.0].state() {
                FrameState::Available => {}
                FrameState::Locked => {
                    if table.records[f.0].owner() == ProcessId::KERNEL && !flags.contains(ReleaseFlags::KERNEL_REL) {
                        return Err(CoreError::InvalidProcess);
                    }
                }
                _ => return Err(CoreError::InvalidProcess),
            }
        }
        for f in frames {
            table.records[f.0].set_state(FrameState::Available);
            table.records[f.0].set_owner(ProcessId::INVALID);
        }
        Ok(())
    }

    /// As [`Self::release`], but additionally requires every `Locked`
    /// frame to be owned by `process`.
    pub fn release_strict(&self, frames: &[FrameId], process: ProcessId, flags: ReleaseFlags) -> CoreResult<()> {
        let mut table = self.inner.lock();
        for f in frames {
            match table.records[f.0].state() {
                FrameState::Available => {}
                FrameState::Locked => {
                    let owner = table.records[f.0].owner();
                    if owner != process {
                        return Err(CoreError::InvalidProcess);
                    }
                    if owner == ProcessId::KERNEL && !flags.contains(ReleaseFlags::KERNEL_REL) {
                        return Err(CoreError::InvalidProcess);
                    }
                }
                _ => return Err(CoreError::InvalidProcess),
            }
        }
        for f in frames {
            table.records[f.0].set_state(FrameState::Available);
            table.records[f.0].set_owner(ProcessId::INVALID);
        }
        Ok(())
    }

    /// Releases every `Locked` frame owned by `process`. A frame owned by
    /// `process` that is not `Locked` indicates record-table corruption.
    pub fn freeproc(&self, process: ProcessId) {
        let mut table = self.inner.lock();
        for rec in table.records.iter_mut() {
            if rec.owner() == process {
                if rec.state() != FrameState::Locked {
                    panic_core::corrupt("frame owned by exiting process was not Locked");
                }
                rec.set_state(FrameState::Available);
                rec.set_owner(ProcessId::INVALID);
            }
        }
    }

    /// Mass-transitions every `Acpi`/`Bootloader` frame to `Available`.
    /// Idempotent: a second call finds nothing left to transition.
    pub fn reclaim(&self) {
        let mut table = self.inner.lock();
        for rec in table.records.iter_mut() {
            if matches!(rec.state(), FrameState::Acpi | FrameState::Bootloader) {
                rec.set_state(FrameState::Available);
                rec.set_owner(ProcessId::INVALID);
            }
        }
    }

    pub fn available_frames(&self) -> usize {
        let table = self.inner.lock();
        table.records.iter().filter(|r| r.state() == FrameState::Available).count()
    }
}

fn find_run(records: &[FrameRecord], count: usize, prefer_high: bool) -> Option<usize> {
    let len = records.len();
    let scan = |range: &mut dyn Iterator<Item = usize>| -> Option<usize> {
        for start in range {
            if start == NULL_FRAME && count == 0 {
                continue;
            }
            if start + count > len {
                continue;
            }
            if (start..start + count).all(|i| i != NULL_FRAME && records[i].state() == FrameState::Available) {
                return Some(start);
            }
        }
        None
    };

    if prefer_high {
        let mut it = (0..=len.saturating_sub(count)).rev();
        scan(&mut it)
    } else {
        let mut it = 0..=len.saturating_sub(count);
        scan(&mut it)
    }
}

unsafe fn clear_frame(frame: FrameId) {
    let aperture_addr = PHYSICAL_APERTURE_BASE + frame.physical_address();
    core::ptr::write_bytes(aperture_addr as *mut u8, 0, PAGE_SIZE);
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;

    fn make_table(total: usize) -> Vec<FrameRecord> {
        vec![FrameRecord::reserved(FrameType::Other); total]
    }

    unsafe fn allocator_over(records: &mut [FrameRecord], regions: &[MemoryRegion]) -> FrameAllocator {
        FrameAllocator::init(records.as_mut_ptr(), records.len(), regions)
    }

    #[test]
    fn acquire_then_release_restores_histogram() {
        let mut backing = make_table(64);
        let regions = [MemoryRegion { first_frame: FrameId::new(1), frame_count: 63, kind: RegionKind::Available }];
        let allocator = unsafe { allocator_over(&mut backing, &regions) };

        let before = allocator.available_frames();
        let frames = allocator.acquire(4, AcquireFlags::empty(), ProcessId::KERNEL, FrameType::Other).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(allocator.available_frames(), before - 4);

        allocator.release(&frames, ReleaseFlags::KERNEL_REL).unwrap();
        assert_eq!(allocator.available_frames(), before);
    }

    #[test]
    fn release_is_idempotent() {
        let mut backing = make_table(16);
        let regions = [MemoryRegion { first_frame: FrameId::new(1), frame_count: 15, kind: RegionKind::Available }];
        let allocator = unsafe { allocator_over(&mut backing, &regions) };

        let frames = allocator.acquire(2, AcquireFlags::empty(), ProcessId::KERNEL, FrameType::Other).unwrap();
        allocator.release(&frames, ReleaseFlags::KERNEL_REL).unwrap();
        allocator.release(&frames, ReleaseFlags::KERNEL_REL).unwrap();
        assert_eq!(allocator.available_frames(), 15);
    }

    #[test]
    fn consecutive_runs_are_sorted_and_contiguous() {
        let mut backing = make_table(32);
        let regions = [MemoryRegion { first_frame: FrameId::new(1), frame_count: 31, kind: RegionKind::Available }];
        let allocator = unsafe { allocator_over(&mut backing, &regions) };

        let frames = allocator
            .acquire(8, AcquireFlags::CONSECUTIVE, ProcessId::KERNEL, FrameType::Other)
            .unwrap();
        for w in frames.windows(2) {
            assert_eq!(w[1].0, w[0].0 + 1);
        }
    }

    #[test]
    fn never_hands_out_frame_zero() {
        let mut backing = make_table(8);
        let regions = [MemoryRegion { first_frame: FrameId::new(0), frame_count: 8, kind: RegionKind::Available }];
        let allocator = unsafe { allocator_over(&mut backing, &regions) };

        let frames = allocator.acquire(7, AcquireFlags::empty(), ProcessId::KERNEL, FrameType::Other).unwrap();
        assert!(frames.iter().all(|f| f.0 != NULL_FRAME));
    }

    #[test]
    fn freeproc_releases_only_that_processs_frames() {
        let mut backing = make_table(16);
        let regions = [MemoryRegion { first_frame: FrameId::new(1), frame_count: 15, kind: RegionKind::Available }];
        let allocator = unsafe { allocator_over(&mut backing, &regions) };
        let p1 = ProcessId::new(1).unwrap();
        let p2 = ProcessId::new(2).unwrap();

        let _f1 = allocator.acquire(2, AcquireFlags::empty(), p1, FrameType::Other).unwrap();
        let f2 = allocator.acquire(2, AcquireFlags::empty(), p2, FrameType::Other).unwrap();
        allocator.freeproc(p1);

        assert_eq!(allocator.available_frames(), 15 - 2);
        allocator.release_strict(&f2, p2, ReleaseFlags::empty()).unwrap();
        assert_eq!(allocator.available_frames(), 15);
    }

    #[test]
    fn reclaim_is_idempotent() {
        let mut backing = make_table(8);
        let regions = [
            MemoryRegion { first_frame: FrameId::new(1), frame_count: 3, kind: RegionKind::Acpi },
            MemoryRegion { first_frame: FrameId::new(4), frame_count: 3, kind: RegionKind::Bootloader },
        ];
        let allocator = unsafe { allocator_over(&mut backing, &regions) };
        allocator.reclaim();
        let after_first = allocator.available_frames();
        allocator.reclaim();
        assert_eq!(allocator.available_frames(), after_first);
        assert_eq!(after_first, 6);
    }
}
