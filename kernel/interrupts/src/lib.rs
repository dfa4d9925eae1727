//! The interrupt manager (C7): a fixed-size handler table indexed by CPU
//! vector, plus an auxiliary ownership table over the driver's routable
//! global interrupt lines.
//!
//! All mutations (acquiring, locking, releasing a slot) take the
//! manager's spinlock; [`invoke`] never does -- it reads the published
//! callback pointer with a single atomic load so the trap stub is never
//! blocked behind whatever else might be touching the table.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use apic::{DeliveryMode, ExternalInterruptRouting};
use core::sync::atomic::{AtomicPtr, Ordering};
use core_error::{CoreError, CoreResult};
use irq_safety::MutexIrqSafe;
use kernel_config::interrupts::{FIRST_ALLOCATABLE_VECTOR, HANDLER_TABLE_LEN};
use memory_structs::ProcessId;

/// Returns `true` if the handler issued EOI itself (e.g. because it needs
/// to do so before a nested condition is resolved); `false` means the
/// manager should do it.
pub type HandlerCallback = fn(u8) -> bool;

struct HandlerSlot {
    owner: MutexIrqSafe<ProcessId>,
    callback: AtomicPtr<()>,
}

const EMPTY_SLOT: HandlerSlot = HandlerSlot { owner: MutexIrqSafe::new(ProcessId::INVALID), callback: AtomicPtr::new(core::ptr::null_mut()) };

static HANDLERS: [HandlerSlot; HANDLER_TABLE_LEN] = [EMPTY_SLOT; HANDLER_TABLE_LEN];

struct ExternalLine {
    owner: ProcessId,
    global_number: u32,
}

static EXTERNAL_LINES: MutexIrqSafe<Vec<Option<ExternalLine>>> = MutexIrqSafe::new(Vec::new());

fn vector_to_index(vector: u8) -> Option<usize> {
    if vector < FIRST_ALLOCATABLE_VECTOR {
        return None;
    }
    let idx = (vector - FIRST_ALLOCATABLE_VECTOR) as usize;
    if idx >= HANDLER_TABLE_LEN {
        None
    } else {
        Some(idx)
    }
}

fn index_to_vector(idx: usize) -> u8 {
    FIRST_ALLOCATABLE_VECTOR + idx as u8
}

fn store_callback(idx: usize, callback: Option<HandlerCallback>) {
    let raw = callback.map(|f| f as *mut ()).unwrap_or(core::ptr::null_mut());
    HANDLERS[idx].callback.store(raw, Ordering::SeqCst);
}

fn load_callback(idx: usize) -> Option<HandlerCallback> {
    let raw = HANDLERS[idx].callback.load(Ordering::SeqCst);
    if raw.is_null() {
        None
    } else {
        // SAFETY: only ever stored from a `HandlerCallback` in `store_callback`.
        Some(unsafe { core::mem::transmute::<*mut (), HandlerCallback>(raw) })
    }
}

/// Seeds the external-line ownership table with `max_global_number + 1`
/// empty entries, so every GSI the driver could ever route has a slot
/// before any `acquire_external` call.
pub fn init(max_global_number: u32) {
    let mut lines = EXTERNAL_LINES.lock();
    lines.clear();
    lines.resize_with(max_global_number as usize + 1, || None);
}

/// Finds the first free handler slot, installs `callback` owned by
/// `process`, and returns its vector.
pub fn acquire_handler(process: ProcessId, callback: HandlerCallback) -> CoreResult<u8> {
    for (idx, slot) in HANDLERS.iter().enumerate() {
        let mut owner = slot.owner.lock();
        if owner.is_invalid() {
            *owner = process;
            drop(owner);
            store_callback(idx, Some(callback));
            return Ok(index_to_vector(idx));
        }
    }
    Err(CoreError::NoFreeVector)
}

/// Installs `callback` owned by `process` at a caller-chosen `vector`.
/// Fails if that slot is already owned.
pub fn lock_handler(process: ProcessId, callback: HandlerCallback, vector: u8) -> CoreResult<()> {
    let idx = vector_to_index(vector).ok_or(CoreError::OutOfBounds)?;
    let mut owner = HANDLERS[idx].owner.lock();
    if !owner.is_invalid() {
        return Err(CoreError::InvalidProcess);
    }
    *owner = process;
    drop(owner);
    store_callback(idx, Some(callback));
    Ok(())
}

/// Replaces the callback installed at `vector` without changing its
/// owner. Published atomically, exactly like initial installation.
pub fn update_handler(vector: u8, callback: HandlerCallback) -> CoreResult<()> {
    let idx = vector_to_index(vector).ok_or(CoreError::OutOfBounds)?;
    let owner = HANDLERS[idx].owner.lock();
    if owner.is_invalid() {
        return Err(CoreError::InvalidProcess);
    }
    drop(owner);
    store_callback(idx, Some(callback));
    Ok(())
}

pub fn release_handler(vector: u8) -> CoreResult<()> {
    let idx = vector_to_index(vector).ok_or(CoreError::OutOfBounds)?;
    let mut owner = HANDLERS[idx].owner.lock();
    if owner.is_invalid() {
        return Err(CoreError::InvalidProcess);
    }
    store_callback(idx, None);
    *owner = ProcessId::INVALID;
    Ok(())
}

fn find_free_line(lines: &[Option<ExternalLine>], allowlist: Option<&[u32]>) -> Option<u32> {
    if let Some(allowed) = allowlist {
        allowed.iter().copied().find(|&g| lines.get(g as usize).map(|e| e.is_none()).unwrap_or(false))
    } else {
        lines.iter().position(|e| e.is_none()).map(|i| i as u32)
    }
}

/// Finds a free global line, records `process` as its owner, and pushes
/// `routing` into the driver. A driver refusal after ownership has been
/// granted indicates the driver's own invariants were violated (e.g. a
/// line outside any IOAPIC's range slipped past this table's sizing), so
/// it is fatal rather than a `Result`.
pub fn acquire_external(process: ProcessId, routing: &mut ExternalInterruptRouting) -> CoreResult<u32> {
    acquire_external_impl(process, routing, None)
}

/// As [`acquire_external`], but only considers lines in `allowed`.
pub fn acquire_external_clamped(process: ProcessId, routing: &mut ExternalInterruptRouting, allowed: &[u32]) -> CoreResult<u32> {
    acquire_external_impl(process, routing, Some(allowed))
}

fn acquire_external_impl(process: ProcessId, routing: &mut ExternalInterruptRouting, allowed: Option<&[u32]>) -> CoreResult<u32> {
    let mut lines = EXTERNAL_LINES.lock();
    let gsi = find_free_line(&lines, allowed).ok_or(CoreError::NoFreeExternalLine)?;
    lines[gsi as usize] = Some(ExternalLine { owner: process, global_number: gsi });
    drop(lines);

    routing.global_number = gsi;
    if apic::set_external_routing(*routing).is_err() {
        panic_core::corrupt("driver refused a routing for a line this table just reserved");
    }
    Ok(gsi)
}

/// Targets a specific global line. `overwrite` permits reassigning a line
/// that already has an owner (releasing the previous one first).
pub fn lock_external(process: ProcessId, routing: ExternalInterruptRouting, overwrite: bool) -> CoreResult<()> {
    let mut lines = EXTERNAL_LINES.lock();
    let gsi = routing.global_number as usize;
    let slot = lines.get_mut(gsi).ok_or(CoreError::OutOfBounds)?;
    if slot.is_some() && !overwrite {
        return Err(CoreError::InvalidProcess);
    }
    *slot = Some(ExternalLine { owner: process, global_number: routing.global_number });
    drop(lines);

    apic::set_external_routing(routing)
}

/// Frees every handler and every external line owned by `process`.
pub fn release_process_resources(process: ProcessId) {
    for (idx, slot) in HANDLERS.iter().enumerate() {
        let mut owner = slot.owner.lock();
        if *owner == process {
            store_callback(idx, None);
            *owner = ProcessId::INVALID;
        }
    }
    let mut lines = EXTERNAL_LINES.lock();
    for slot in lines.iter_mut() {
        if matches!(slot, Some(line) if line.owner == process) {
            *slot = None;
        }
    }
}

/// Called from the low-level trap stub. Never takes the manager's lock.
pub fn invoke(vector: u8) {
    let Some(idx) = vector_to_index(vector) else {
        apic::signal_eoi();
        return;
    };
    let eoi_sent = match load_callback(idx) {
        Some(callback) => callback(vector),
        None => false,
    };
    if !eoi_sent {
        apic::signal_eoi();
    }
}

/// Thin IPI facade: resolves to `apic::send_ipi` so callers depending on
/// the manager don't also need a direct `apic` dependency.
pub fn send_ipi(target_cpu: u32, vector: u8, mode: DeliveryMode, deassert: bool, wait_for_receipt: bool) -> CoreResult<()> {
    apic::send_ipi(target_cpu, vector, mode, deassert, wait_for_receipt)
}
