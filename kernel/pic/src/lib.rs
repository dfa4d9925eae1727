//! The legacy 8259 master/slave PIC pair.
//!
//! Present on every x86-64 platform whether or not it's used; MADT's
//! `legacy_pic_present` flag just says whether firmware expects the OS to
//! deal with it. When the LAPIC/IOAPIC driver takes over, this PIC is
//! remapped off the CPU exception range and then fully masked so spurious
//! legacy vectors never fire.

#![no_std]

use port_io::Port;

const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

/// Vector offsets the master/slave PIC are remapped to before being
/// masked -- chosen to sit safely below `kernel_config::interrupts`'s
/// allocatable range, and never unmasked again.
const MASTER_OFFSET: u8 = 0x20;
const SLAVE_OFFSET: u8 = 0x28;

/// Remaps both PICs off the CPU exception vectors and masks every line.
/// Idempotent: a second call just re-masks.
pub fn disable() {
    let mut master_cmd = Port::<u8>::new(MASTER_CMD);
    let mut master_data = Port::<u8>::new(MASTER_DATA);
    let mut slave_cmd = Port::<u8>::new(SLAVE_CMD);
    let mut slave_data = Port::<u8>::new(SLAVE_DATA);

    unsafe {
        master_cmd.write(ICW1_INIT | ICW1_ICW4);
        io_wait();
        slave_cmd.write(ICW1_INIT | ICW1_ICW4);
        io_wait();

        master_data.write(MASTER_OFFSET);
        io_wait();
        slave_data.write(SLAVE_OFFSET);
        io_wait();

        master_data.write(4); // slave PIC is on IRQ2
        io_wait();
        slave_data.write(2);
        io_wait();

        master_data.write(ICW4_8086);
        io_wait();
        slave_data.write(ICW4_8086);
        io_wait();

        // Mask every line.
        master_data.write(0xFF);
        slave_data.write(0xFF);
    }

    log::debug!("legacy PIC remapped to {MASTER_OFFSET:#x}/{SLAVE_OFFSET:#x} and fully masked");
}

/// A write to an unused port, long enough to let the (potentially very
/// old) PIC hardware catch up with the previous command.
fn io_wait() {
    unsafe { Port::<u8>::new(0x80).write(0) };
}
