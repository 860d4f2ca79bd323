//! Kernel logging sinks.
//!
//! Logging comes up in two phases. Before the heap exists, a raw
//! early-serial path writes straight to COM1 with no locks and no
//! allocation. Once the heap is functional the full [`Logger`] takes
//! over: a sink list behind a spin lock, per-sink level filtering, and
//! a tick timestamp on every record. Both phases publish themselves
//! through the pluggable function slots in `kaon-core`, so every crate
//! logs the same way regardless of phase.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use kaon_core::log::LogLevel;
use kaon_core::sync::{Once, SpinLock};

/// A kernel log output sink.
pub trait LogSink: Send + Sync {
    /// Writes one string fragment.
    fn write_str(&self, s: &str);

    /// Most verbose level this sink accepts.
    fn max_level(&self) -> LogLevel;

    /// Diagnostic name.
    fn name(&self) -> &str;
}

/// The full, post-heap logger.
pub struct Logger {
    sinks: SpinLock<Vec<Box<dyn LogSink>>>,
}

impl Logger {
    fn new() -> Self {
        Self {
            sinks: SpinLock::new(Vec::new()),
        }
    }

    fn add_sink(&self, sink: Box<dyn LogSink>) {
        self.sinks.lock().push(sink);
    }

    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        let ticks = crate::time::now();
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            if level <= sink.max_level() {
                let mut writer = SinkWriter { sink: sink.as_ref() };
                // Formatting into a sink never fails; the sink has no
                // error path.
                let _ = write!(writer, "[{:>8}.{:03}] {} ", ticks / 1000, ticks % 1000, level.name());
                let _ = writer.write_fmt(args);
                sink.write_str("\n");
            }
        }
    }

    fn print(&self, args: fmt::Arguments<'_>) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            let mut writer = SinkWriter { sink: sink.as_ref() };
            let _ = writer.write_fmt(args);
        }
    }
}

/// Adapts a [`LogSink`] to `core::fmt::Write`.
struct SinkWriter<'a> {
    sink: &'a dyn LogSink,
}

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.sink.write_str(s);
        Ok(())
    }
}

static LOGGER: Once<Logger> = Once::new();

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if let Some(logger) = LOGGER.get() {
        logger.log(level, args);
    }
}

fn logger_print(args: fmt::Arguments<'_>) {
    if let Some(logger) = LOGGER.get() {
        logger.print(args);
    }
}

/// Installs the full logger and routes the `kaon-core` macros at it.
///
/// Requires a working heap. Sinks are registered with [`add_sink`].
pub fn init_logger() {
    LOGGER.set(Logger::new());
    // SAFETY: logger_log / logger_print are callable from any context;
    // they fall back to dropping output until LOGGER is published.
    unsafe {
        kaon_core::log::set_log_fn(logger_log);
        kaon_core::log::set_print_fn(logger_print);
    }
}

/// Registers an additional output sink with the full logger.
///
/// # Panics
///
/// Panics when called before [`init_logger`].
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.expect("logger not initialized").add_sink(sink);
}

/// Phase-one logging: raw serial output with no locks, for the window
/// between entry and heap bring-up.
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub fn init_early_serial() {
    crate::arch::x86::serial::init_com1();

    fn early_print(args: fmt::Arguments<'_>) {
        let mut writer = crate::arch::x86::serial::Com1Writer;
        let _ = writer.write_fmt(args);
    }

    fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
        let mut writer = crate::arch::x86::serial::Com1Writer;
        let _ = write!(writer, "[ early  ] {} ", level.name());
        let _ = writer.write_fmt(args);
        let _ = writer.write_str("\n");
    }

    // SAFETY: the early functions write to COM1 port registers only,
    // which is safe from any context once the UART is initialized.
    unsafe {
        kaon_core::log::set_print_fn(early_print);
        kaon_core::log::set_log_fn(early_log);
    }
}

/// A [`LogSink`] writing to the COM1 UART.
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub struct SerialSink {
    max_level: LogLevel,
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
impl SerialSink {
    /// Creates a serial sink accepting records up to `max_level`.
    #[must_use]
    pub fn new(max_level: LogLevel) -> Self {
        Self { max_level }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                crate::arch::x86::serial::write_byte(b'\r');
            }
            crate::arch::x86::serial::write_byte(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    struct RecordingSink {
        records: &'static Mutex<String>,
        max_level: LogLevel,
    }

    impl LogSink for RecordingSink {
        fn write_str(&self, s: &str) {
            self.records.lock().unwrap().push_str(s);
        }

        fn max_level(&self) -> LogLevel {
            self.max_level
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[test]
    fn records_are_level_filtered_and_stamped() {
        static RECORDS: Mutex<String> = Mutex::new(String::new());

        let logger = Logger::new();
        logger.add_sink(Box::new(RecordingSink {
            records: &RECORDS,
            max_level: LogLevel::Info,
        }));

        logger.log(LogLevel::Info, format_args!("hello {}", 42));
        logger.log(LogLevel::Debug, format_args!("filtered out"));

        let text = RECORDS.lock().unwrap();
        assert!(text.contains("INFO"));
        assert!(text.contains("hello 42"));
        assert!(!text.contains("filtered out"));
    }

    #[test]
    fn print_bypasses_levels() {
        static RECORDS: Mutex<String> = Mutex::new(String::new());

        let logger = Logger::new();
        logger.add_sink(Box::new(RecordingSink {
            records: &RECORDS,
            max_level: LogLevel::Fatal,
        }));

        logger.print(format_args!("raw output"));
        assert!(RECORDS.lock().unwrap().contains("raw output"));
    }
}
