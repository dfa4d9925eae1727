//! Legacy PIT driver (part of C9): channel 0 only, one-shot or periodic,
//! driven entirely through I/O ports the way `pic` drives the 8259.
//!
//! There is no way to read the current divisor count back out cheaply
//! (doing so correctly needs a latch command and a two-byte read with
//! interrupts disabled around it), so [`get_counter`] always reports `0`;
//! callers that need elapsed time should prefer a counter-capable source.

#![no_std]

use core::sync::atomic::{AtomicBool, Ordering};
use core_error::{CoreError, CoreResult};
use port_io::Port;

const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;

const MODE_ONE_SHOT: u8 = 0b0011_0000;
const MODE_PERIODIC: u8 = 0b0011_0100;

/// Input clock, common to every PC-compatible PIT.
pub const FREQUENCY_HZ: u64 = 1_193_182;
pub const MAX_DIVISOR: u16 = 0xFFFF;

static RUNNING: AtomicBool = AtomicBool::new(false);

fn program(mode: u8, divisor: u16) -> CoreResult<()> {
    if divisor == 0 {
        return Err(CoreError::TimerInvalidParams);
    }
    if RUNNING.swap(true, Ordering::AcqRel) {
        return Err(CoreError::TimerAlreadyRunning);
    }
    unsafe {
        Port::<u8>::new(COMMAND).write(mode);
        Port::<u8>::new(CHANNEL0_DATA).write((divisor & 0xFF) as u8);
        Port::<u8>::new(CHANNEL0_DATA).write((divisor >> 8) as u8);
    }
    Ok(())
}

/// Arms channel 0 in mode 0 (interrupt on terminal count): fires once,
/// `divisor` input-clock ticks from now.
pub fn start_one_shot(divisor: u16) -> CoreResult<()> {
    program(MODE_ONE_SHOT, divisor)
}

/// Arms channel 0 in mode 2 (rate generator): fires every `divisor`
/// input-clock ticks until [`stop`].
pub fn start_periodic(divisor: u16) -> CoreResult<()> {
    program(MODE_PERIODIC, divisor)
}

/// Masks channel 0's wire at the PIC/IOAPIC is the caller's job; this just
/// clears the locally-tracked running flag so a later `start_*` is
/// accepted again. The PIT hardware itself has no "stop" command short of
/// reprogramming it, which the next `start_*` call does anyway.
pub fn stop() -> CoreResult<()> {
    RUNNING.store(false, Ordering::Release);
    Ok(())
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// Always `0`; see module docs.
pub fn get_counter() -> u16 {
    0
}

/// Converts a tick count at [`FREQUENCY_HZ`] into a divisor, saturating at
/// [`MAX_DIVISOR`] the way the original driver caps a too-large request
/// rather than silently wrapping it.
pub fn divisor_for_period_nanos(nanos: u64) -> u16 {
    let ticks = (FREQUENCY_HZ as u128 * nanos as u128) / 1_000_000_000u128;
    ticks.min(MAX_DIVISOR as u128) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn divisor_matches_known_tick_rate() {
        // 1.193182 MHz / 59659 ~= 20.006 Hz, i.e. ~50ms -- the time-keeping
        // tick this divisor is chosen for elsewhere.
        assert_eq!(divisor_for_period_nanos(50_000_000), 59_659);
    }

    #[test]
    fn large_period_saturates_at_max_divisor() {
        assert_eq!(divisor_for_period_nanos(1_000_000_000), MAX_DIVISOR);
    }
}
