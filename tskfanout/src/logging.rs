//! Process-wide structured logging, built the way `flux::logging` builds it: a
//! `sloggers` config turned into a `slog::Logger` once at start, then cloned with
//! `logger.new(o!(...))` into every component that needs one.

pub use slog::{debug, error, info, o, warn, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// 0=error, 1=info, 2=debug, matching the `log-level` config key in the proxy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl LogLevel {
    pub fn from_int(level: i64) -> Option<LogLevel> {
        match level {
            0 => Some(LogLevel::Error),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn severity(self) -> Severity {
        match self {
            LogLevel::Error => Severity::Error,
            LogLevel::Info => Severity::Info,
            LogLevel::Debug => Severity::Debug,
        }
    }
}

/// Builds the terminal logger used by the proxy and by library unit tests.
pub fn init(level: LogLevel) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level.severity());
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to build terminal logger")
}

/// A logger that discards everything, for backends/tests that don't care to observe output.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
