//! Timer manager (C10): one [`TimerDriver`] trait over the C9 driver set
//! (`hpet`, `pit`, `tsc`, plus the LAPIC timer mode `apic` exposes),
//! picking a local/external/counter role for each, calibrating what needs
//! calibrating, and providing [`delay`] and the BSP/AP TSC-offset barrier.
//!
//! The adapters below live here rather than in `hpet`/`pit`/`tsc`
//! themselves so those crates don't need to depend back on this one just
//! to know the trait exists.

#![no_std]

use apic::TimerDivide;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core_error::{CoreError, CoreResult};
use irq_safety::MutexIrqSafe;
use kernel_config::interrupts::{VECTOR_EXTERNAL_CLOCK_TICK, VECTOR_LOCAL_TIMER};
use kernel_config::time::{TSC_CALIBRATION_TOLERANCE, TSC_SYNC_SETTLE_MILLIS, TSC_SYNC_TOLERANCE};
use spin::Once;

bitflags::bitflags! {
    pub struct TimerFeatures: u32 {
        const ONE_SHOT  = 1 << 0;
        const PERIODIC  = 1 << 1;
        const COUNTER   = 1 << 2;
        const INVARIANT = 1 << 3;
        const LOCAL     = 1 << 4;
        const EXTERNAL  = 1 << 5;
        const DIVISOR   = 1 << 6;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

/// Common surface every timer source presents, whether it's armable
/// (LAPIC, HPET, PIT) or counter-only (TSC).
pub trait TimerDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn features(&self) -> TimerFeatures;
    fn frequency_hz(&self) -> CoreResult<u64>;
    fn start(&self, mode: TimerMode, ticks: u64) -> CoreResult<()>;
    fn stop(&self) -> CoreResult<()>;
    fn is_running(&self) -> bool;
    fn counter(&self) -> u64;
    fn max_value(&self) -> u64;
}

struct LocalTimerDriver;
static LOCAL_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);

impl TimerDriver for LocalTimerDriver {
    fn name(&self) -> &'static str {
        "lapic"
    }
    fn features(&self) -> TimerFeatures {
        TimerFeatures::ONE_SHOT | TimerFeatures::PERIODIC | TimerFeatures::LOCAL
    }
    fn frequency_hz(&self) -> CoreResult<u64> {
        match LOCAL_FREQUENCY_HZ.load(Ordering::Acquire) {
            0 => Err(CoreError::NoCounter),
            hz => Ok(hz),
        }
    }
    fn start(&self, mode: TimerMode, ticks: u64) -> CoreResult<()> {
        let ticks = u32::try_from(ticks).map_err(|_| CoreError::TimerInvalidParams)?;
        match mode {
            TimerMode::OneShot => apic::timer_start_one_shot(VECTOR_LOCAL_TIMER, TimerDivide::By1, ticks),
            TimerMode::Periodic => apic::timer_start_periodic(VECTOR_LOCAL_TIMER, TimerDivide::By1, ticks),
        }
    }
    fn stop(&self) -> CoreResult<()> {
        apic::timer_stop();
        Ok(())
    }
    fn is_running(&self) -> bool {
        apic::timer_is_running()
    }
    fn counter(&self) -> u64 {
        apic::timer_current_count() as u64
    }
    fn max_value(&self) -> u64 {
        u32::MAX as u64
    }
}

struct HpetComparatorDriver(u8);

impl TimerDriver for HpetComparatorDriver {
    fn name(&self) -> &'static str {
        "hpet"
    }
    fn features(&self) -> TimerFeatures {
        TimerFeatures::ONE_SHOT | TimerFeatures::PERIODIC | TimerFeatures::COUNTER | TimerFeatures::EXTERNAL
    }
    fn frequency_hz(&self) -> CoreResult<u64> {
        Ok(hpet::frequency_hz())
    }
    fn start(&self, mode: TimerMode, ticks: u64) -> CoreResult<()> {
        match mode {
            TimerMode::OneShot => {
                let target = hpet::get_counter().wrapping_add(ticks);
                hpet::start_one_shot(self.0, target)
            }
            TimerMode::Periodic => hpet::start_periodic(self.0, ticks),
        }
    }
    fn stop(&self) -> CoreResult<()> {
        hpet::stop(self.0)
    }
    fn is_running(&self) -> bool {
        hpet::is_running(self.0)
    }
    fn counter(&self) -> u64 {
        hpet::get_counter()
    }
    fn max_value(&self) -> u64 {
        if hpet::counter_width_64() {
            u64::MAX
        } else {
            u32::MAX as u64
        }
    }
}

struct PitDriver;

impl TimerDriver for PitDriver {
    fn name(&self) -> &'static str {
        "pit"
    }
    fn features(&self) -> TimerFeatures {
        TimerFeatures::ONE_SHOT | TimerFeatures::PERIODIC | TimerFeatures::EXTERNAL | TimerFeatures::DIVISOR
    }
    fn frequency_hz(&self) -> CoreResult<u64> {
        Ok(pit::FREQUENCY_HZ)
    }
    fn start(&self, mode: TimerMode, ticks: u64) -> CoreResult<()> {
        let divisor = u16::try_from(ticks).map_err(|_| CoreError::TimerInvalidParams)?;
        match mode {
            TimerMode::OneShot => pit::start_one_shot(divisor),
            TimerMode::Periodic => pit::start_periodic(divisor),
        }
    }
    fn stop(&self) -> CoreResult<()> {
        pit::stop()
    }
    fn is_running(&self) -> bool {
        pit::is_running()
    }
    fn counter(&self) -> u64 {
        pit::get_counter() as u64
    }
    fn max_value(&self) -> u64 {
        pit::MAX_DIVISOR as u64
    }
}

struct TscDriver;

impl TimerDriver for TscDriver {
    fn name(&self) -> &'static str {
        "tsc"
    }
    fn features(&self) -> TimerFeatures {
        let mut f = TimerFeatures::COUNTER;
        if tsc::is_invariant() {
            f |= TimerFeatures::INVARIANT;
        }
        f
    }
    fn frequency_hz(&self) -> CoreResult<u64> {
        tsc::frequency_hz().ok_or(CoreError::NoCounter)
    }
    fn start(&self, _mode: TimerMode, _ticks: u64) -> CoreResult<()> {
        Err(CoreError::InvalidTimerMode)
    }
    fn stop(&self) -> CoreResult<()> {
        Err(CoreError::InvalidTimerMode)
    }
    fn is_running(&self) -> bool {
        true
    }
    fn counter(&self) -> u64 {
        tsc::read()
    }
    fn max_value(&self) -> u64 {
        u64::MAX
    }
}

static LOCAL_DRIVER: LocalTimerDriver = LocalTimerDriver;
static PIT_DRIVER: PitDriver = PitDriver;
static TSC_DRIVER: TscDriver = TscDriver;
static HPET_EXTERNAL_DRIVER: HpetComparatorDriver = HpetComparatorDriver(0);
static HPET_COUNTER_DRIVER: HpetComparatorDriver = HpetComparatorDriver(0);

static LOCAL: Once<&'static dyn TimerDriver> = Once::new();
static EXTERNAL: Once<&'static dyn TimerDriver> = Once::new();
static COUNTER: Once<&'static dyn TimerDriver> = Once::new();
static TSC_RELIABLE: AtomicBool = AtomicBool::new(false);

pub fn local() -> &'static dyn TimerDriver {
    *LOCAL.get().expect("timer::init was not called")
}

pub fn external() -> &'static dyn TimerDriver {
    *EXTERNAL.get().expect("timer::init was not called")
}

pub fn counter() -> &'static dyn TimerDriver {
    *COUNTER.get().expect("timer::init was not called")
}

/// Picks the local/external/counter roles, routes the external timer's GSI
/// (legacy-replacement when HPET offers it, the ISA IRQ0 line otherwise),
/// and calibrates the LAPIC timer and (if present) the TSC against the
/// chosen external/counter sources.
///
/// ACPI's Power Management Timer is never selected here: it is a real
/// ACPI-defined counter source, but nothing in this workspace implements
/// one -- the fallback chain goes straight from HPET to the PIT instead of
/// inventing a PM-timer driver with no grounding.
pub fn init() -> CoreResult<()> {
    let external_driver: &'static dyn TimerDriver = if hpet::is_present() && hpet::legacy_replacement_capable() {
        hpet::set_legacy_replacement(true)?;
        route_external_timer(0)?;
        &HPET_EXTERNAL_DRIVER
    } else {
        route_external_timer(pit_gsi())?;
        &PIT_DRIVER
    };
    EXTERNAL.call_once(|| external_driver);

    let counter_driver: &'static dyn TimerDriver = if tsc::is_invariant() {
        &TSC_DRIVER
    } else if hpet::is_present() {
        &HPET_COUNTER_DRIVER
    } else {
        return Err(CoreError::NoCounter);
    };
    COUNTER.call_once(|| counter_driver);
    LOCAL.call_once(|| &LOCAL_DRIVER);

    calibrate_tsc();
    calibrate_local_timer()?;
    Ok(())
}

/// ISA IRQ0 (bus 0) is where the PIT is wired; `apic::get_ext_int` applies
/// any MADT interrupt-source override that remapped it onto a different GSI.
fn pit_gsi() -> u32 {
    apic::get_ext_int(0, 0)
}

/// Points `gsi`'s IOAPIC redirection entry at the time-keeping vector,
/// targeting the bootstrap processor -- the external timer only ever
/// drives BSP-local time-keeping, never a per-core interrupt.
fn route_external_timer(gsi: u32) -> CoreResult<()> {
    let tables = acpi::get_acpi_tables();
    let routing = apic::ExternalInterruptRouting {
        global_number: gsi,
        local_vector: VECTOR_EXTERNAL_CLOCK_TICK,
        target_cpu: tables.bsp_apic_id,
        active_low: false,
        level_triggered: true,
        low_priority: false,
        masked: false,
    };
    interrupts::lock_external(memory_structs::ProcessId::KERNEL, routing, true)
}

/// Derives the TSC's frequency from CPUID leaf 0x15 when available;
/// otherwise measures it against whichever external/counter source is not
/// itself the TSC, over [`TSC_SYNC_SETTLE_MILLIS`]. A measured value more
/// than [`TSC_CALIBRATION_TOLERANCE`] away from the CPUID-reported one is
/// discarded in favor of the measurement, on the assumption that CPUID's
/// crystal-frequency field is the one more likely to be approximate.
fn calibrate_tsc() {
    if !tsc::is_invariant() {
        return;
    }
    let reference = if core::ptr::eq(counter() as *const dyn TimerDriver as *const (), &TSC_DRIVER as *const _ as *const ()) {
        external()
    } else {
        counter()
    };

    let measured = measure_frequency(reference, &TSC_DRIVER);
    match (tsc::frequency_from_cpuid(), measured) {
        (Some(cpuid_hz), Some(measured_hz)) => {
            let spread = (cpuid_hz as f64 - measured_hz as f64).abs() / cpuid_hz as f64;
            let hz = if spread > TSC_CALIBRATION_TOLERANCE { measured_hz } else { cpuid_hz };
            tsc::set_calibrated_frequency(hz);
        }
        (Some(hz), None) => tsc::set_calibrated_frequency(hz),
        (None, Some(hz)) => tsc::set_calibrated_frequency(hz),
        (None, None) => {}
    }
}

/// Arms the LAPIC timer one-shot at its maximum count, busy-waits a fixed
/// reference interval on `reference`, stops the LAPIC timer, and derives
/// its frequency from how much of the maximum count it burned through.
fn calibrate_local_timer() -> CoreResult<()> {
    let reference = external();
    let reference_hz = reference.frequency_hz()?;
    let window_ticks = (reference_hz as u128 * TSC_SYNC_SETTLE_MILLIS as u128 / 1000) as u64;

    apic::timer_start_one_shot(VECTOR_LOCAL_TIMER, TimerDivide::By1, u32::MAX)?;
    wait_reference_window(reference, window_ticks)?;
    let remaining = apic::timer_current_count() as u64;
    apic::timer_stop();

    let consumed = (u32::MAX as u64).saturating_sub(remaining);
    let hz = (consumed as u128 * 1000 / TSC_SYNC_SETTLE_MILLIS as u128) as u64;
    LOCAL_FREQUENCY_HZ.store(hz, Ordering::Release);
    Ok(())
}

fn measure_frequency(reference: &dyn TimerDriver, target: &dyn TimerDriver) -> Option<u64> {
    let reference_hz = reference.frequency_hz().ok()?;
    let window_ticks = (reference_hz as u128 * TSC_SYNC_SETTLE_MILLIS as u128 / 1000) as u64;

    let target_start = target.counter();
    wait_reference_window(reference, window_ticks).ok()?;
    let target_elapsed = target.counter().wrapping_sub(target_start);
    Some((target_elapsed as u128 * 1000 / TSC_SYNC_SETTLE_MILLIS as u128) as u64)
}

/// Busy-waits for `window_ticks` of `reference`'s own ticks to pass.
///
/// Counter-capable references (HPET) are polled directly. The PIT exposes
/// neither a counter readback (`pit::get_counter` is hardwired to `0`) nor
/// an `is_running` that clears itself when a one-shot's count actually
/// reaches zero in hardware -- only `pit::stop` clears it -- so its
/// one-shot completion is observed the one way it's available: a temporary
/// handler on its own routed GSI, repeated across however many one-shot
/// periods (each capped at [`pit::MAX_DIVISOR`]) the window needs.
fn wait_reference_window(reference: &dyn TimerDriver, window_ticks: u64) -> CoreResult<()> {
    if reference.features().contains(TimerFeatures::COUNTER) {
        let start = reference.counter();
        while reference.counter().wrapping_sub(start) < window_ticks {
            core::hint::spin_loop();
        }
        return Ok(());
    }

    let mut remaining = window_ticks;
    while remaining > 0 {
        let divisor = remaining.min(pit::MAX_DIVISOR as u64).max(1) as u16;
        wait_for_pit_one_shot(divisor)?;
        remaining -= divisor as u64;
    }
    Ok(())
}

static PIT_CALIBRATION_FIRED: AtomicBool = AtomicBool::new(false);

fn pit_calibration_handler(_vector: u8) -> bool {
    PIT_CALIBRATION_FIRED.store(true, Ordering::Release);
    false
}

/// Arms the PIT one-shot for `divisor` input-clock ticks and busy-waits for
/// it to fire. Only ever called while `external()` is the PIT, so its GSI
/// is already routed to [`VECTOR_EXTERNAL_CLOCK_TICK`] by `route_external_timer`
/// -- this just claims that vector's handler slot for the duration of the
/// wait (nothing else has claimed it yet this boot) rather than disturbing
/// the routing itself.
fn wait_for_pit_one_shot(divisor: u16) -> CoreResult<()> {
    PIT_CALIBRATION_FIRED.store(false, Ordering::Release);
    interrupts::lock_handler(memory_structs::ProcessId::KERNEL, pit_calibration_handler, VECTOR_EXTERNAL_CLOCK_TICK)?;

    pit::start_one_shot(divisor)?;
    while !PIT_CALIBRATION_FIRED.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    let result = pit::stop();

    let _ = interrupts::release_handler(VECTOR_EXTERNAL_CLOCK_TICK);
    result
}

/// Busy-waits for approximately `nanos` nanoseconds, reading the counter
/// role's free-running counter. Handles one counter wraparound
/// transparently via wrapping subtraction; a caller asking for a delay
/// longer than the counter's own period would need a different design,
/// but nothing in this workspace does that.
pub fn delay(nanos: u64) {
    let driver = counter();
    let Ok(hz) = driver.frequency_hz() else { return };
    let target_ticks = (nanos as u128 * hz as u128 / 1_000_000_000u128) as u64;
    let start = driver.counter();
    while driver.counter().wrapping_sub(start) < target_ticks {
        core::hint::spin_loop();
    }
}

struct SyncReference {
    counter_at_reference: u64,
    tsc_at_reference: u64,
}

static SYNC_REFERENCE: Once<SyncReference> = Once::new();
static TSC_OFFSETS: MutexIrqSafe<alloc_free_vec::Vec<i64>> = MutexIrqSafe::new(alloc_free_vec::Vec::new());

mod alloc_free_vec {
    //! A fixed-capacity stand-in for `alloc::vec::Vec<i64>` sized to the
    //! workspace's practical core count, so the TSC-offset table doesn't
    //! need a heap allocation before the kernel heap necessarily exists.
    pub struct Vec {
        entries: [i64; 256],
        len: usize,
    }

    impl Vec {
        pub const fn new() -> Vec {
            Vec { entries: [0; 256], len: 0 }
        }

        pub fn set(&mut self, index: usize, value: i64) {
            if index >= self.entries.len() {
                return;
            }
            self.entries[index] = value;
            if index >= self.len {
                self.len = index + 1;
            }
        }

        pub fn get(&self, index: usize) -> i64 {
            if index < self.entries.len() {
                self.entries[index]
            } else {
                0
            }
        }
    }
}

/// Called once by the bootstrap processor after every application
/// processor it started has run [`ap_sync`]: records the BSP's own TSC
/// reading alongside the external timer's counter at that same moment, so
/// every AP's [`ap_sync`] call can compute an offset relative to it.
pub fn bsp_sync() {
    let reference = external();
    SYNC_REFERENCE.call_once(|| SyncReference { counter_at_reference: reference.counter(), tsc_at_reference: tsc::read() });
    TSC_RELIABLE.store(tsc::is_invariant(), Ordering::Release);
}

/// Called once by each application processor, after it has run
/// `cpu::init_this_cpu`. Reads its own TSC, adjusts for the external
/// timer's elapsed ticks since [`bsp_sync`] ran, and records the resulting
/// offset so cross-core TSC comparisons (e.g. interlink envelope ordering)
/// can be corrected back to the BSP's timeline. A spread beyond
/// [`TSC_SYNC_TOLERANCE`] marks the TSC unreliable as a cross-core clock
/// for the rest of this boot.
pub fn ap_sync(os_id: u32) {
    let Some(reference) = SYNC_REFERENCE.get() else {
        return;
    };
    let ext = external();
    let Ok(ext_hz) = ext.frequency_hz() else {
        return;
    };
    let Some(tsc_hz) = tsc::frequency_hz() else {
        return;
    };

    let elapsed_ext_ticks = ext.counter().wrapping_sub(reference.counter_at_reference);
    let elapsed_nanos = elapsed_ext_ticks as u128 * 1_000_000_000u128 / ext_hz as u128;
    let expected_tsc = reference.tsc_at_reference.wrapping_add(((elapsed_nanos * tsc_hz as u128) / 1_000_000_000u128) as u64);

    let actual_tsc = tsc::read();
    let offset = actual_tsc as i64 - expected_tsc as i64;

    let spread = (offset as f64).abs() / tsc_hz as f64;
    if spread > TSC_SYNC_TOLERANCE {
        TSC_RELIABLE.store(false, Ordering::Release);
        log::warn!("core {os_id}: TSC offset {offset} ticks exceeds sync tolerance, TSC no longer trusted cross-core");
    }

    let mut offsets = TSC_OFFSETS.lock();
    offsets.set(os_id as usize, offset);
}

/// Whether the TSC is still considered safely comparable across cores
/// (invariant, and every AP's `ap_sync` offset landed within tolerance).
pub fn tsc_reliable() -> bool {
    TSC_RELIABLE.load(Ordering::Acquire)
}

#[cfg(test)]
mod test {
    use super::alloc_free_vec::Vec;

    #[test]
    fn offset_table_roundtrips() {
        let mut v = Vec::new();
        v.set(3, -42);
        assert_eq!(v.get(3), -42);
        assert_eq!(v.get(0), 0);
    }
}
