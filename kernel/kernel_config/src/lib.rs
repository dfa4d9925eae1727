//! Compile-time configuration constants for the platform core.
//!
//! There is no runtime configuration surface (no files, environment
//! variables, or CLI flags) in this workspace; everything a lower-level
//! crate needs to agree on with its siblings lives here, split into
//! `memory`, `interrupts`, and `time` modules the way sibling subsystems
//! are split into their own crates.

#![no_std]

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod memory {
            //! The fixed virtual-address layout of the kernel half of
            //! every address space.

            /// Bytes per page / frame.
            pub const PAGE_SIZE: usize = 4096;
            pub const PAGE_SHIFT: usize = 12;

            /// Number of address bits that are significant on this
            /// platform; addresses above this are non-canonical.
            pub const VIRTUAL_ADDRESS_BITS: u32 = 48;

            /// Entries per page table level.
            pub const ENTRIES_PER_TABLE: usize = 512;

            /// Frame 0 is the null sentinel: never allocated, never mapped.
            pub const NULL_FRAME: usize = 0;

            /// Frame statically reserved for the AP bootstrap trampoline.
            pub const AP_INIT_FRAME: usize = 8;

            /// Base of the direct physical-memory aperture, mapped with
            /// 2 MiB huge pages over every present frame range.
            pub const PHYSICAL_APERTURE_BASE: usize = 0xFFFF_8000_0000_0000;

            /// Base of the kernel heap's virtual address range.
            pub const KERNEL_HEAP_BASE: usize = 0xFFFF_C000_0000_0000;
            pub const KERNEL_HEAP_MAX_SIZE: usize = 0x0000_2000_0000_0000;

            /// Base of the window used for device MMIO (LAPIC, IOAPIC, HPET).
            pub const SHARED_MMIO_BASE: usize = 0xFFFF_E000_0000_0000;

            /// Base at which the kernel image itself is linked and loaded.
            pub const KERNEL_IMAGE_BASE: usize = 0xFFFF_FFFF_8000_0000;

            /// Minimum alignment the kernel heap hands out.
            pub const HEAP_MIN_ALIGN: usize = 16;
        }

        pub mod interrupts {
            //! Vector layout: the first 32 vectors are CPU exceptions and
            //! are never allocatable; everything from 0x20 is managed by
            //! the interrupt manager except the fixed vectors below.
            pub const FIRST_ALLOCATABLE_VECTOR: u8 = 0x20;
            pub const HANDLER_TABLE_LEN: usize = 224;

            pub const VECTOR_NMI: u8 = 0x02;
            pub const VECTOR_LOCAL_TIMER: u8 = 0xEF;
            pub const VECTOR_LAPIC_ERROR: u8 = 0xFE;
            pub const VECTOR_INTERLINK: u8 = 0xFD;
            pub const VECTOR_EXTERNAL_CLOCK_TICK: u8 = 0xFC;
            pub const VECTOR_SPURIOUS: u8 = 0xFF;
        }

        pub mod time {
            /// Delay used between INIT and STARTUP IPIs during AP bring-up.
            pub const AP_INIT_DELAY_MICROS: u64 = 10_000;
            /// First post-SIPI settle delay.
            pub const AP_SIPI_DELAY_MICROS: u64 = 2_000;
            /// Upper bound before giving up on an AP.
            pub const AP_START_TIMEOUT_MICROS: u64 = 1_000_000;

            /// Tick period used for the external time-keeping timer once
            /// `bsp_sync` hands off to the time-keeping module.
            pub const TIME_KEEPING_TICK_MICROS: u64 = 50_000;
            /// PIT divisor equivalent to the 50 ms time-keeping tick.
            pub const PIT_TIME_KEEPING_DIVISOR: u16 = 59_659;

            /// Settle delay inside the TSC synchronization barrier.
            pub const TSC_SYNC_SETTLE_MILLIS: u64 = 100;
            /// Relative spread above which the TSC is declared unreliable.
            pub const TSC_SYNC_TOLERANCE: f64 = 0.0001;
            /// Relative spread above which an invariant-TSC calibration
            /// against CPUID leaf 0x15 is discarded in favor of the
            /// observed reference count.
            pub const TSC_CALIBRATION_TOLERANCE: f64 = 0.01;
        }
    } else {
        compile_error!("axon-core's platform core is only specified for x86-64");
    }
}
