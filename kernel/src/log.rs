// Kernel Logging Subsystem
//
// Implements the kernel's structured logging framework, providing
// multi-level, timestamped log output for diagnostics and debugging of the
// memory and scheduling core.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error, Panic)
// - Attach timestamps and subsystem origin to every log entry
// - Include source location only for DEBUG entries (file:line)
// - Forward formatted lines to a registered output sink
//
// Design principles:
// - Log messages below the current level are dropped before formatting
// - Early-boot friendly: no allocation, works before the scheduler exists
// - Logging is best-effort and never required for correctness
//
// Implementation details:
// - The level lives in an atomic so interrupt handlers can read it
// - Timestamps are derived from the global timer tick counter
// - The sink is a plain function pointer registered at boot (`set_sink`);
//   until then output is discarded, which is also what host tests see
//
// Developer ergonomics:
// - Convenience macros (`log_debug!`, `log_info!`, etc.) wrap `_log`
// - Macros automatically capture `file!()` and `line!()` for debug context

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Panic = 4,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Panic,
        }
    }
}

pub type LogSink = fn(fmt::Arguments);

static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static SINK: AtomicPtr<()> = AtomicPtr::new(discard as LogSink as *mut ());

fn discard(_args: fmt::Arguments) {}

pub fn init(level: LogLevel) {
    set_level(level);
}

pub fn set_level(level: LogLevel) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_raw(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_sink(sink: LogSink) {
    SINK.store(sink as *mut (), Ordering::Release);
}

fn sink() -> LogSink {
    let ptr = SINK.load(Ordering::Acquire);
    // SAFETY: only `set_sink` and the initializer store into SINK, and both
    // store a valid `LogSink`.
    unsafe { core::mem::transmute::<*mut (), LogSink>(ptr) }
}

fn format_timestamp(ms: u64) -> (u64, u64) {
    let seconds = ms / 1000;
    let milliseconds = ms % 1000;
    (seconds, milliseconds)
}

pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    if level < get_level() {
        return;
    }

    let (seconds, milliseconds) = format_timestamp(crate::timer::uptime_ms());
    let level_str = level.as_str();
    let write = sink();

    if level == LogLevel::Debug {
        write(format_args!(
            "[t={}.{:03}s] [{}] [{}] {} ({}:{})\n",
            seconds,
            milliseconds,
            level_str,
            origin,
            args,
            file,
            line
        ));
    } else {
        write(format_args!(
            "[t={}.{:03}s] [{}] [{}] {}\n",
            seconds,
            milliseconds,
            level_str,
            origin,
            args
        ));
    }
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_panic {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Panic,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;

    static CAPTURED: spin::Mutex<String> = spin::Mutex::new(String::new());

    fn capture(args: fmt::Arguments) {
        use core::fmt::Write;
        let _ = CAPTURED.lock().write_fmt(args);
    }

    #[test]
    fn level_round_trips_through_atomic() {
        assert_eq!(LogLevel::from_raw(LogLevel::Warn as u8), LogLevel::Warn);
        assert_eq!(LogLevel::from_raw(200), LogLevel::Panic);
        assert!(LogLevel::Debug < LogLevel::Error);
    }

    #[test]
    fn registered_sink_receives_formatted_lines() {
        set_sink(capture);
        log_error!("log-test", "frame {} lost", 7);

        let out = CAPTURED.lock();
        assert!(out.contains("[ERROR] [log-test] frame 7 lost"));
    }

    #[test]
    fn timestamp_splits_milliseconds() {
        assert_eq!(format_timestamp(12_345), (12, 345));
    }
}
