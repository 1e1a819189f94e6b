//! Leveled logging with a host-installed sink.
//!
//! The allocator has no console of its own. Hosts that want to see what the
//! allocator does install a sink with [`set_logger`]; until then every log
//! call is discarded. The sink is called while the allocator is in the middle
//! of an operation (and, through [`LockedHeap`](crate::LockedHeap), while its
//! lock is held), so it must not allocate from the same heap.

use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use spin::Once;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*)
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*)
    };
}

/// A function receiving every enabled log record.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

static LOGGER: Once<LogFn> = Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// Installs the log sink.
///
/// Only the first call has an effect. Returns `true` if `logger` was
/// installed.
pub fn set_logger(logger: LogFn) -> bool {
    let mut installed = false;
    LOGGER.call_once(|| {
        installed = true;
        logger
    });
    installed
}

/// Sets the least severe level that is passed to the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level >= max_level() && LOGGER.is_completed()
}

pub fn log(level: LogLevel, message: fmt::Arguments<'_>) {
    if level < max_level() {
        return;
    }
    if let Some(logger) = LOGGER.get() {
        logger(level, message);
    }
}

/// Colored, fixed-width rendering of a [`LogLevel`] for terminal sinks.
#[derive(Debug, Clone, Copy)]
pub struct LevelFormat(pub LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => 35,
            LogLevel::Debug => 34,
            LogLevel::Info => 32,
            LogLevel::Warn => 33,
            LogLevel::Error => 31,
        };
        let msg = match self.0 {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}
