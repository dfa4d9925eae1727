//! Interlink message passing (C11): per-CPU inbound queues paired with
//! per-CPU handler tables under one lock per core, delivered by the
//! interlink IPI vector.
//!
//! A message sent to more than one core (broadcast) shares a single
//! refcounted envelope; whichever receiving core's decrement reaches zero
//! frees it, unless the sender set [`MessageFlags::DONT_FREE`] to keep the
//! body alive past delivery (the sender then owns cleanup itself).

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use apic::DeliveryMode;
use core::sync::atomic::{AtomicU32, Ordering};
use core_error::{CoreError, CoreResult};
use irq_safety::MutexIrqSafe;
use kernel_config::interrupts::VECTOR_INTERLINK;
use memory_structs::ProcessId;

bitflags::bitflags! {
    pub struct MessageFlags: u32 {
        const NONE      = 0;
        const DONT_FREE = 1 << 0;
    }
}

/// Number of distinct message `kind`s a core can register a handler for.
/// Chosen generously above any plausible number of interlink message
/// kinds (TLB shootdown, scheduler wake, halt, ...) this workspace defines.
const MAX_MESSAGE_KINDS: usize = 64;

pub type HandlerCallback = fn(&Message);

pub struct Message {
    pub kind: u32,
    pub param: u32,
    pub flags: MessageFlags,
    pub source_cpu: u32,
    pub body: Option<Box<[u8]>>,
}

struct Envelope {
    message: Message,
    refcount: AtomicU32,
}

struct PerCpuState {
    queue: VecDeque<*mut Envelope>,
    handlers: [Option<HandlerCallback>; MAX_MESSAGE_KINDS],
}

unsafe impl Send for PerCpuState {}

static STATE: MutexIrqSafe<Vec<PerCpuState>> = MutexIrqSafe::new(Vec::new());

/// Sizes the per-CPU table for `max_cpus` cores -- the MADT-reported
/// count, since every core that will ever exist this boot is already
/// known before any of them sends a message -- and installs this
/// crate's own IPI handler on [`VECTOR_INTERLINK`], so every core
/// (the BSP included) gets messages dispatched the moment the vector
/// fires rather than only on cores that happen to poll for them.
pub fn init(max_cpus: usize) {
    let mut state = STATE.lock();
    state.clear();
    for _ in 0..max_cpus {
        state.push(PerCpuState { queue: VecDeque::new(), handlers: [None; MAX_MESSAGE_KINDS] });
    }
    drop(state);

    if interrupts::lock_handler(ProcessId::KERNEL, handle_interlink_ipi, VECTOR_INTERLINK).is_err() {
        panic_core::corrupt("interlink IPI vector already claimed before interlink::init");
    }
}

/// The interrupt manager's registered callback for [`VECTOR_INTERLINK`].
/// Drains the receiving core's queue and signals EOI itself -- the
/// manager's own EOI-on-`false` fallback exists for callbacks that don't,
/// not for this one.
fn handle_interlink_ipi(_vector: u8) -> bool {
    dispatch_for_current_cpu();
    apic::signal_eoi();
    true
}

/// Installs (or, with `None`, clears) this core's own handler for `kind`.
/// Each core registers independently: two cores can run different
/// callbacks for the same message kind, or only one of them can care
/// about it at all.
pub fn set_handler(kind: u32, callback: Option<HandlerCallback>) -> CoreResult<()> {
    let idx = kind as usize;
    if idx >= MAX_MESSAGE_KINDS {
        return Err(CoreError::OutOfBounds);
    }
    let os_id = cpu::current().os_id().value() as usize;
    let mut state = STATE.lock();
    let per_cpu = state.get_mut(os_id).ok_or(CoreError::InvalidProcess)?;
    per_cpu.handlers[idx] = callback;
    Ok(())
}

/// Enqueues `message` for `target_cpu` and signals it with the interlink
/// IPI. With `checked`, waits for IPI delivery and surfaces a failure;
/// without it, the message is left queued regardless -- if the IPI
/// eventually does land despite a reported delivery failure, it is still
/// processed normally.
pub fn send(target_cpu: u32, message: Message, checked: bool) -> CoreResult<()> {
    let envelope = Box::into_raw(Box::new(Envelope { message, refcount: AtomicU32::new(1) }));
    {
        let mut state = STATE.lock();
        let per_cpu = state.get_mut(target_cpu as usize).ok_or_else(|| {
            // SAFETY: just allocated above, never shared yet.
            unsafe { drop(Box::from_raw(envelope)) };
            CoreError::InvalidProcess
        })?;
        per_cpu.queue.push_back(envelope);
    }
    interrupts::send_ipi(target_cpu, VECTOR_INTERLINK, DeliveryMode::Fixed, false, checked)
}

/// Enqueues `message` for every core (optionally including this one) and
/// signals each with the interlink IPI. All recipients share one envelope;
/// the last one to process it frees the body (unless `DONT_FREE`).
pub fn broadcast(message: Message, include_self: bool, checked: bool) -> CoreResult<()> {
    let self_id = cpu::current().os_id().value();
    let total_cpus = STATE.lock().len() as u32;
    let targets: Vec<u32> = (0..total_cpus).filter(|&c| include_self || c != self_id).collect();
    if targets.is_empty() {
        return Ok(());
    }

    let envelope = Box::into_raw(Box::new(Envelope { message, refcount: AtomicU32::new(targets.len() as u32) }));
    {
        let mut state = STATE.lock();
        for &target in &targets {
            state[target as usize].queue.push_back(envelope);
        }
    }

    let mut first_err = None;
    for &target in &targets {
        if let Err(e) = interrupts::send_ipi(target, VECTOR_INTERLINK, DeliveryMode::Fixed, false, checked) {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Drains this core's inbound queue, running each message's registered
/// handler (if any) and releasing its share of the envelope's refcount.
/// Called from [`handle_interlink_ipi`], the callback `init` installs on
/// [`VECTOR_INTERLINK`] for every core; also safe to call directly (e.g.
/// from an idle loop) for a core that wants to poll its queue between
/// interrupts.
pub fn dispatch_for_current_cpu() {
    let os_id = cpu::current().os_id().value() as usize;
    loop {
        let (envelope_ptr, handler) = {
            let mut state = STATE.lock();
            let Some(per_cpu) = state.get_mut(os_id) else { return };
            let Some(ptr) = per_cpu.queue.pop_front() else { return };
            let kind = unsafe { (*ptr).message.kind } as usize;
            let handler = per_cpu.handlers.get(kind).copied().flatten();
            (ptr, handler)
        };

        let envelope = unsafe { &*envelope_ptr };
        if let Some(callback) = handler {
            callback(&envelope.message);
        }

        if envelope.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut boxed = unsafe { Box::from_raw(envelope_ptr) };
            if boxed.message.flags.contains(MessageFlags::DONT_FREE) {
                // Sender owns the body's lifetime; leak only the body
                // rather than dropping a buffer they still expect to
                // read. The envelope wrapper itself is still dropped
                // normally below -- `DONT_FREE` says nothing about it.
                if let Some(body) = boxed.message.body.take() {
                    core::mem::forget(body);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn broadcast_refcount_matches_target_count() {
        let envelope = Envelope {
            message: Message { kind: 0, param: 0, flags: MessageFlags::NONE, source_cpu: 0, body: None },
            refcount: AtomicU32::new(3),
        };
        assert_eq!(envelope.refcount.fetch_sub(1, Ordering::AcqRel), 3);
        assert_eq!(envelope.refcount.fetch_sub(1, Ordering::AcqRel), 2);
        assert_eq!(envelope.refcount.fetch_sub(1, Ordering::AcqRel), 1);
    }

    #[test]
    fn dont_free_flag_roundtrips() {
        let flags = MessageFlags::DONT_FREE;
        assert!(flags.contains(MessageFlags::DONT_FREE));
        assert!(!MessageFlags::NONE.contains(MessageFlags::DONT_FREE));
    }
}
