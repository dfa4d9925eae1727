//! A minimal `log::Log` implementation that writes to COM1.
//!
//! This is installed once, before `axon_core::init` touches any other
//! subsystem, so that every crate downstream can log through the `log`
//! facade instead of writing to the serial port directly. It deliberately
//! knows nothing about the framebuffer console (out of scope, §1).

#![no_std]

use core::fmt::Write;
use irq_safety::MutexIrqSafe;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use port_io::Port;

const COM1: u16 = 0x3F8;

struct SerialPort(Port<u8>);

impl SerialPort {
    const fn new(base: u16) -> Self {
        SerialPort(Port::new(base))
    }

    fn init(&mut self) {
        unsafe {
            self.0.write(0x00); // disable interrupts out of this port
        }
        let mut p = |off: u16, v: u8| Port::<u8>::new(COM1 + off).write(v);
        unsafe {
            p(3, 0x80); // enable DLAB
            p(0, 0x03); // divisor low byte: 38400 baud
            p(1, 0x00); // divisor high byte
            p(3, 0x03); // 8 bits, no parity, one stop bit
            p(2, 0xC7); // enable FIFO, clear, 14-byte threshold
            p(4, 0x0B); // IRQs enabled, RTS/DSR set
        }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            while Port::<u8>::new(COM1 + 5).read() & 0x20 == 0 {}
            self.0.write(byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

static SERIAL: MutexIrqSafe<SerialPort> = MutexIrqSafe::new(SerialPort::new(COM1));

struct EarlyLogger;

impl Log for EarlyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = SERIAL.lock();
        let _ = writeln!(
            port,
            "[{:>5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: EarlyLogger = EarlyLogger;

/// Installs the global logger. Must be called exactly once, before any
/// other platform-core crate emits a log record.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    SERIAL.lock().init();
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}
