//! Default serial logging sink over the primary 16550 UART.

use core::fmt::{self, Write};

use spin::Mutex;
use uart_16550::SerialPort;

use crate::logger::{self, LogLevel, LogSink};

const COM1: u16 = 0x3F8;

static PORT: Mutex<Option<SerialPort>> = Mutex::new(None);
static SINK: SerialSink = SerialSink;

struct SerialSink;

impl LogSink for SerialSink {
    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        let mut guard = PORT.lock();
        if let Some(port) = guard.as_mut() {
            let _ = write!(port, "[{:<5}] {}\n", level.as_str(), args);
        }
    }
}

/// Initialize COM1 and install it as the kernel log sink.
pub fn init() {
    {
        let mut guard = PORT.lock();
        if guard.is_none() {
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            *guard = Some(port);
        }
    }
    logger::set_sink(&SINK);
}
