//! Handling for the platform core's corruption-class errors.
//!
//! Corruption (`HeapTagCorrupt`, `UnexpectedFrameState`, `DoubleInit`) is
//! never returned as a `Result`: the detecting call site calls [`fatal`],
//! which never returns. This crate sits at the bottom of the dependency
//! graph -- every crate that can detect corruption depends on it -- so it
//! cannot itself depend on the interrupt driver to broadcast a halt IPI.
//! Instead `axon_core`'s init sequence installs the halt callback once the
//! interrupt driver is up, via [`set_halt_others`].

#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

type HaltOthersFn = fn();

static HALT_OTHERS: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static HALTING: AtomicBool = AtomicBool::new(false);

/// Registers the function used to stop every other CPU before this one
/// halts. Called once, during `axon_core::init`, after the interrupt
/// driver (C6) is initialized.
pub fn set_halt_others(f: HaltOthersFn) {
    HALT_OTHERS.store(f as *mut (), Ordering::SeqCst);
}

/// Stops the system after a corruption error.
///
/// Logs the failure, sends a halt IPI to every other CPU (if the halt
/// callback has been installed yet -- a corruption detected before C6 is up
/// simply skips that step, since there is no other CPU running), then
/// disables interrupts on the calling CPU and loops forever. There is no
/// landing pad for unwinding in this workspace (`panic = "abort"`), so this
/// function, like `core::panic::PanicInfo`'s handler, simply never returns.
pub fn fatal(reason: &str, info: fmt::Arguments<'_>) -> ! {
    log::error!("FATAL: {reason}: {info}");

    if !HALTING.swap(true, Ordering::SeqCst) {
        let ptr = HALT_OTHERS.load(Ordering::SeqCst);
        if !ptr.is_null() {
            // SAFETY: only ever stored from `set_halt_others`, as a valid
            // `fn()`.
            let halt: HaltOthersFn = unsafe { core::mem::transmute(ptr) };
            halt();
        }
    }

    loop {
        unsafe {
            core::arch::asm!("cli");
            core::arch::asm!("hlt");
        }
    }
}

/// Convenience form for corruption detected with no extra context.
pub fn corrupt(reason: &str) -> ! {
    fatal(reason, format_args!("no additional context"))
}
