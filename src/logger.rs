//! Logging with colored module prefixes.
//!
//! Every component receives a [`Logger`] at construction time instead of
//! reaching for a process-wide instance, so tests can run isolated loggers
//! side by side and inspect what was written.
//!
//! # Example
//!
//! ```ignore
//! let logger = Logger::stdout();
//! log!(logger, "watch"; "watching {} globs", count);
//! debug!(logger, "watch"; "raw event: {:?}", event);
//! ```

use std::io::{Write, stdout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;
use parking_lot::Mutex;

// ============================================================================
// Log Macros
// ============================================================================

/// Log an info message with a colored module prefix
///
/// # Usage
/// ```ignore
/// log!(logger, "module"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        $logger.write($crate::logger::Level::Info, $module, &format!($($arg)*))
    }};
}

/// Log a debug message (only recorded when the logger is verbose)
#[macro_export]
macro_rules! debug {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        if $logger.is_verbose() {
            $logger.write($crate::logger::Level::Debug, $module, &format!($($arg)*))
        }
    }};
}

/// Log a warning
#[macro_export]
macro_rules! warn {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        $logger.write($crate::logger::Level::Warn, $module, &format!($($arg)*))
    }};
}

/// Log an error
#[macro_export]
macro_rules! error {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        $logger.write($crate::logger::Level::Error, $module, &format!($($arg)*))
    }};
}

// ============================================================================
// Logger
// ============================================================================

/// Log level of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A captured log line (memory sink only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub module: String,
    pub message: String,
}

enum Sink {
    Stdout,
    Memory(Mutex<Vec<LogRecord>>),
}

struct Inner {
    verbose: AtomicBool,
    sink: Sink,
}

/// Cheaply cloneable logger handle.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    /// Logger writing colored lines to stdout.
    pub fn stdout() -> Self {
        Self::with_sink(Sink::Stdout)
    }

    /// Logger capturing records in memory (verbose by default).
    pub fn memory() -> Self {
        let logger = Self::with_sink(Sink::Memory(Mutex::new(Vec::new())));
        logger.set_verbose(true);
        logger
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            inner: Arc::new(Inner {
                verbose: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// Builder-style verbose toggle.
    pub fn verbose(self, verbose: bool) -> Self {
        self.set_verbose(verbose);
        self
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.verbose.store(verbose, Ordering::SeqCst);
    }

    pub fn is_verbose(&self) -> bool {
        self.inner.verbose.load(Ordering::SeqCst)
    }

    /// Write one record. Prefer the macros.
    pub fn write(&self, level: Level, module: &str, message: &str) {
        match &self.inner.sink {
            Sink::Stdout => {
                let prefix = colorize_prefix(level, module);
                let mut stdout = stdout().lock();
                writeln!(stdout, "{prefix} {message}").ok();
                stdout.flush().ok();
            }
            Sink::Memory(records) => records.lock().push(LogRecord {
                level,
                module: module.to_string(),
                message: message.to_string(),
            }),
        }
    }

    /// Captured records (empty for the stdout sink).
    pub fn records(&self) -> Vec<LogRecord> {
        match &self.inner.sink {
            Sink::Stdout => Vec::new(),
            Sink::Memory(records) => records.lock().clone(),
        }
    }

    /// Whether any captured record at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("verbose", &self.is_verbose())
            .finish_non_exhaustive()
    }
}

/// Apply color to a module prefix based on level and module
fn colorize_prefix(level: Level, module: &str) -> String {
    let prefix = format!("[{module}]");
    match level {
        Level::Error => prefix.bright_red().bold().to_string(),
        Level::Warn => prefix.yellow().bold().to_string(),
        Level::Debug => prefix.dimmed().to_string(),
        Level::Info => match module {
            "lifecycle" => prefix.bright_blue().bold().to_string(),
            "watch" => prefix.bright_green().bold().to_string(),
            "webview" => prefix.bright_magenta().bold().to_string(),
            _ => prefix.bright_yellow().bold().to_string(),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_captures_records() {
        let logger = Logger::memory();
        crate::log!(logger, "watch"; "watching {} globs", 2);
        crate::warn!(logger, "state"; "checksum mismatch");

        let records = logger.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].module, "watch");
        assert_eq!(records[0].message, "watching 2 globs");
        assert!(logger.contains(Level::Warn, "checksum"));
    }

    #[test]
    fn test_debug_respects_verbose() {
        let logger = Logger::memory().verbose(false);
        crate::debug!(logger, "watch"; "hidden");
        assert!(logger.records().is_empty());

        logger.set_verbose(true);
        crate::debug!(logger, "watch"; "shown");
        assert_eq!(logger.records().len(), 1);
    }

    #[test]
    fn test_loggers_are_isolated() {
        let a = Logger::memory();
        let b = Logger::memory();
        crate::log!(a, "lifecycle"; "only in a");
        assert_eq!(a.records().len(), 1);
        assert!(b.records().is_empty());
    }

    #[test]
    fn test_stdout_sink_has_no_records() {
        let logger = Logger::stdout();
        assert!(logger.records().is_empty());
    }
}
