//! Leveled kernel logging with a pluggable sink.
//!
//! The `kfatal!`..`ktrace!` macros in the crate root all funnel through
//! [`log`]. Where the output goes is the embedding kernel's business: it
//! installs a [`LogSink`] once at boot (the [`crate::serial`] module provides
//! the usual 16550 sink). Messages emitted before a sink exists are dropped.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Once;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info.priority());
static SINK: Once<&'static dyn LogSink> = Once::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub(crate) const fn priority(self) -> u8 {
        match self {
            LogLevel::Fatal => 0,
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::Fatal,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Destination for formatted log lines. Implementations must tolerate being
/// called from interrupt context; the serial sink serializes internally.
pub trait LogSink: Sync {
    fn write(&self, level: LogLevel, args: fmt::Arguments<'_>);
}

/// Install the log sink. Only the first call wins.
pub fn set_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write(level, args);
    }
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}
