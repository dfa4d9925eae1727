//! Shared, returnable error type for the platform core.
//!
//! Corruption is deliberately not a variant here: a detected corruption
//! never becomes a `Result`, it goes straight to `panic_core::fatal`.

#![no_std]

use core::fmt;

/// Every recoverable failure mode a platform-core crate can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    // Configuration / discovery
    MissingRsdp,
    BadChecksum,
    MissingMadt,
    MissingFadt,
    NoLapic,
    NoIoapic,
    NoCounter,

    // Resource exhaustion
    OutOfFrames,
    OutOfHeap,
    NoFreeVector,
    NoFreeExternalLine,

    // Protocol
    IpiDeliveryFailed,
    ApDidNotStart(u32),
    InvalidTimerMode,
    TimerAlreadyRunning,
    TimerInvalidParams,

    // Argument
    Unaligned,
    OutOfBounds,
    InvalidProcess,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CoreError::MissingRsdp => write!(f, "no RSDP pointer supplied by the bootloader payload"),
            CoreError::BadChecksum => write!(f, "ACPI table checksum did not sum to zero"),
            CoreError::MissingMadt => write!(f, "ACPI MADT table is absent"),
            CoreError::MissingFadt => write!(f, "ACPI FADT table is absent"),
            CoreError::NoLapic => write!(f, "MADT contains zero usable local APIC entries"),
            CoreError::NoIoapic => write!(f, "MADT contains zero I/O APIC entries"),
            CoreError::NoCounter => write!(f, "no usable counter-capable timer source was found"),
            CoreError::OutOfFrames => write!(f, "physical page allocator has no run of frames satisfying the request"),
            CoreError::OutOfHeap => write!(f, "kernel heap virtual window is exhausted"),
            CoreError::NoFreeVector => write!(f, "interrupt manager has no free handler-table slot"),
            CoreError::NoFreeExternalLine => write!(f, "interrupt manager has no free external-line ownership slot"),
            CoreError::IpiDeliveryFailed => write!(f, "IPI delivery-status bit never cleared"),
            CoreError::ApDidNotStart(cpu) => write!(f, "application processor {cpu} did not start"),
            CoreError::InvalidTimerMode => write!(f, "timer mode is not supported by this driver"),
            CoreError::TimerAlreadyRunning => write!(f, "timer start requested while already running"),
            CoreError::TimerInvalidParams => write!(f, "timer start parameters are out of range for this driver"),
            CoreError::Unaligned => write!(f, "address is not aligned to the required boundary"),
            CoreError::OutOfBounds => write!(f, "index or address lies outside its owning table"),
            CoreError::InvalidProcess => write!(f, "process id is reserved or does not own the referenced resource"),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
