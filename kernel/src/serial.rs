// Serial Port Log Sink (COM1)
//
// Minimal output-only driver for the legacy COM1 UART, used as the kernel's
// diagnostic sink on bare metal. `init` programs the port and registers it
// with the logging subsystem; until then log output is discarded.
//
// Implementation details:
// - Port I/O through `x86_64::instructions::port::Port`
// - UART configured for 38400 baud (divisor 3), 8N1, FIFO enabled
// - Loopback self-test before the port is considered usable
// - Transmit holding register polled before each byte
// - Newlines are normalized to CRLF for terminal compatibility
//
// Concurrency and safety:
// - The port sits behind a spinlock
// - Writes run with interrupts disabled so an interrupt handler that logs
//   cannot deadlock on the lock held by the code it interrupted

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::arch::without_interrupts;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Programs the UART and returns whether the loopback test passed.
    ///
    /// # Safety
    ///
    /// The caller must own the I/O ports at this base address.
    pub unsafe fn init(&mut self) -> bool {
        self.int_enable.write(0x00);
        self.line_ctrl.write(0x80);
        self.data.write(0x03);
        self.int_enable.write(0x00);
        self.line_ctrl.write(0x03);
        self.fifo_ctrl.write(0xC7);
        self.modem_ctrl.write(0x0B);

        self.modem_ctrl.write(0x1E);
        self.data.write(0xAE);
        if self.data.read() != 0xAE {
            return false;
        }

        self.modem_ctrl.write(0x0F);
        true
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: the port was claimed in `init`.
        unsafe {
            while self.line_status.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));
static READY: AtomicBool = AtomicBool::new(false);

/// Brings up COM1 and routes kernel log output to it.
pub fn init() {
    // SAFETY: COM1 is reserved for kernel diagnostics.
    let ok = without_interrupts(|| unsafe { SERIAL1.lock().init() });
    if ok {
        READY.store(true, Ordering::Release);
        crate::log::set_sink(write_fmt);
    }
}

fn write_fmt(args: fmt::Arguments) {
    use core::fmt::Write;

    if !READY.load(Ordering::Acquire) {
        return;
    }
    without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}
