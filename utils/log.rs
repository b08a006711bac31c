//! Simple logging implementation for Ferrovisor
//!
//! This module provides a minimal `log::Log` backend suitable for a no_std
//! hypervisor environment. Records are formatted as
//! `[LEVEL] target: message` and handed to a [`ConsoleWrite`] sink.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

/// Console output sink used by the logger
pub trait ConsoleWrite: Send + Sync {
    /// Write a formatted line fragment
    fn write_str(&self, s: &str);
}

/// Get the compile-time log level
pub fn level() -> LevelFilter {
    #[cfg(feature = "verbose")]
    {
        LevelFilter::Trace
    }

    #[cfg(all(feature = "debug", not(feature = "verbose")))]
    {
        LevelFilter::Debug
    }

    #[cfg(not(any(feature = "debug", feature = "verbose")))]
    {
        LevelFilter::Info
    }
}

struct ConsoleLogger {
    sink: &'static dyn ConsoleWrite,
    level: LevelFilter,
}

struct SinkWriter<'a>(&'a dyn ConsoleWrite);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut w = SinkWriter(self.sink);
        let _ = writeln!(w, "[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Once<ConsoleLogger> = Once::new();

/// Install the console logger. Only the first call takes effect.
pub fn init(sink: &'static dyn ConsoleWrite) -> Result<(), &'static str> {
    let mut installed = false;
    let logger = LOGGER.call_once(|| {
        installed = true;
        ConsoleLogger { sink, level: level() }
    });
    if !installed {
        return Err("logger already initialized");
    }
    log::set_logger(logger).map_err(|_| "another logger is installed")?;
    log::set_max_level(logger.level);
    Ok(())
}
