//! Per-CPU storage (part of C8): a dense OS-assigned [`CpuId`] for every
//! core, and the per-core block each core's CPU-local base register
//! points at once it has run [`init_this_cpu`].
//!
//! There is no recycling: a core that never comes up never gets an id,
//! and ids are handed out strictly in the order `init_this_cpu` is
//! called, which is always BSP-first.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};
use derive_more::{Binary, Display, LowerHex, Octal, UpperHex};
use spin::Once;

const IA32_GS_BASE: u32 = 0xC000_0101;

/// A dense, OS-assigned identifier for a CPU core. `0` is always the
/// bootstrap processor.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Binary, Octal, LowerHex, UpperHex)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_bootstrap_cpu(&self) -> bool {
        self.0 == 0
    }
}

impl From<CpuId> for u32 {
    fn from(value: CpuId) -> u32 {
        value.0
    }
}

/// The block every core's CPU-local base register points at. `this_ptr`
/// lets code that already has a `&PerCpuBlock` recover its own address
/// without re-reading the base register.
#[repr(C)]
pub struct PerCpuBlock {
    this_ptr: *const PerCpuBlock,
    os_id: CpuId,
    /// This core's LAPIC id, as reported by the ACPI MADT entry it was
    /// started from.
    arch_id: u32,
}

unsafe impl Sync for PerCpuBlock {}

static NEXT_CPU_ID: AtomicU32 = AtomicU32::new(0);
static BSP_ID: Once<CpuId> = Once::new();

fn allocate_cpu_id() -> CpuId {
    CpuId(NEXT_CPU_ID.fetch_add(1, Ordering::SeqCst))
}

pub fn cpu_count() -> usize {
    NEXT_CPU_ID.load(Ordering::SeqCst) as usize
}

pub fn bootstrap_cpu() -> Option<CpuId> {
    BSP_ID.get().copied()
}

/// Allocates a dense id for the core currently executing, builds and
/// leaks its `PerCpuBlock`, programs `IA32_GS_BASE` to point at it, and
/// tells the interrupt driver which dense id is now "self" for IPI
/// self-target checks. Must run exactly once per core, on that core.
pub fn init_this_cpu(arch_id: u32) -> CpuId {
    let os_id = allocate_cpu_id();
    if os_id.value() == 0 {
        BSP_ID.call_once(|| os_id);
    }

    let block = Box::new(PerCpuBlock { this_ptr: core::ptr::null(), os_id, arch_id });
    let leaked: &'static mut PerCpuBlock = Box::leak(block);
    leaked.this_ptr = leaked as *const PerCpuBlock;

    unsafe { x86_64::registers::model_specific::Msr::new(IA32_GS_BASE).write(leaked as *const PerCpuBlock as u64) };
    apic::set_current_cpu_index(os_id.value());

    os_id
}

/// Returns the current core's per-CPU block, read through `IA32_GS_BASE`.
/// Panics (well-formed: a `None`-dereference-style bug surfaces as a null
/// pointer read, not UB) if `init_this_cpu` has not yet run on this core.
pub fn current() -> &'static PerCpuBlock {
    let addr = unsafe { x86_64::registers::model_specific::Msr::new(IA32_GS_BASE).read() };
    assert!(addr != 0, "cpu::current() called before cpu::init_this_cpu() on this core");
    unsafe { &*(addr as *const PerCpuBlock) }
}

impl PerCpuBlock {
    pub fn os_id(&self) -> CpuId {
        self.os_id
    }

    pub fn arch_id(&self) -> u32 {
        self.arch_id
    }

    pub fn this_ptr(&self) -> *const PerCpuBlock {
        self.this_ptr
    }
}
