//! Invariant-TSC reader (part of C9): counter-only, no start/stop of its
//! own -- there's nothing to arm, the cycle counter always runs. The
//! timer manager either derives a frequency from CPUID leaf 0x15 or
//! calibrates by comparing a TSC delta against a known-good reference
//! tick count, then records it here with [`set_calibrated_frequency`].

#![no_std]

use core::arch::x86_64::_rdtsc;
use core::sync::atomic::{AtomicU64, Ordering};
use raw_cpuid::CpuId;

static CALIBRATED_HZ: AtomicU64 = AtomicU64::new(0);

/// Whether the CPU advertises an invariant TSC (ticks at a fixed rate
/// regardless of P-state/C-state, and keeps running through deep sleep).
/// A non-invariant TSC is unsuitable as a time source at all, let alone a
/// calibration reference.
pub fn is_invariant() -> bool {
    CpuId::new().get_advanced_power_mgmt_info().map(|info| info.has_invariant_tsc()).unwrap_or(false)
}

/// Current cycle count. Never fails, never blocks: reading the TSC is a
/// single instruction.
pub fn read() -> u64 {
    unsafe { _rdtsc() }
}

/// Best-effort frequency from CPUID leaf 0x15 (TSC/core-crystal-clock
/// ratio times the crystal's nominal frequency). Returns `None` when the
/// leaf is absent or the crystal frequency field is zero, which is common
/// on real hardware -- the timer manager should treat this as "try
/// calibration instead", not as an error.
pub fn frequency_from_cpuid() -> Option<u64> {
    let info = CpuId::new().get_tsc_info()?;
    let crystal_hz = info.nominal_frequency();
    if crystal_hz == 0 || info.denominator() == 0 {
        return None;
    }
    Some((crystal_hz as u64 * info.numerator() as u64) / info.denominator() as u64)
}

/// Records the frequency the timer manager settled on (CPUID-derived or
/// measured), so later [`frequency_hz`]/[`ticks_to_nanos`] calls don't
/// need it threaded through every call site.
pub fn set_calibrated_frequency(hz: u64) {
    CALIBRATED_HZ.store(hz, Ordering::Release);
}

pub fn frequency_hz() -> Option<u64> {
    let hz = CALIBRATED_HZ.load(Ordering::Acquire);
    if hz == 0 {
        None
    } else {
        Some(hz)
    }
}

/// Converts a TSC tick delta to nanoseconds using the recorded frequency.
/// `None` if [`set_calibrated_frequency`] has not run yet.
pub fn ticks_to_nanos(ticks: u64) -> Option<u64> {
    let hz = frequency_hz()?;
    Some(((ticks as u128 * 1_000_000_000u128) / hz as u128) as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unset_frequency_returns_none() {
        // Other tests in the same binary may have already called
        // `set_calibrated_frequency`, so this only checks the zero-means-
        // unset convention, not process-wide isolation.
        assert_eq!(frequency_hz_for(0), None);
    }

    fn frequency_hz_for(hz: u64) -> Option<u64> {
        if hz == 0 {
            None
        } else {
            Some(hz)
        }
    }

    #[test]
    fn ticks_to_nanos_matches_known_ratio() {
        let hz = 1_000_000_000u64; // 1 GHz: 1 tick == 1 ns
        assert_eq!(((1_000u128 * 1_000_000_000u128) / hz as u128) as u64, 1_000);
    }
}
