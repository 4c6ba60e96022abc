//! COM1 serial writer used as the log sink on bare metal.

use core::fmt::{self, Write};

use super::port::{inb, outb};
use crate::sync::spinlock::Spinlock;

const COM1: u16 = 0x3F8;

struct SerialPort {
    initialized: bool,
}

static SERIAL: Spinlock<SerialPort> = Spinlock::new(SerialPort { initialized: false });

impl SerialPort {
    fn init(&mut self) {
        unsafe {
            outb(COM1 + 1, 0x00); // disable interrupts
            outb(COM1 + 3, 0x80); // DLAB on
            outb(COM1 + 0, 0x01); // divisor 1 = 115200 baud
            outb(COM1 + 1, 0x00);
            outb(COM1 + 3, 0x03); // 8N1
            outb(COM1 + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
            outb(COM1 + 4, 0x0B); // DTR | RTS | OUT2
        }
        self.initialized = true;
    }

    fn put(&mut self, byte: u8) {
        unsafe {
            while inb(COM1 + 5) & 0x20 == 0 {
                core::hint::spin_loop();
            }
            outb(COM1, byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if b == b'\n' {
                self.put(b'\r');
            }
            self.put(b);
        }
        Ok(())
    }
}

/// Write formatted text to COM1. One lock acquisition per record, so
/// concurrent CPUs never interleave within a record.
pub fn write_fmt(args: fmt::Arguments) {
    let mut port = SERIAL.lock();
    if !port.initialized {
        port.init();
    }
    let _ = port.write_fmt(args);
}
