//! Console capture for sandboxed code.
//!
//! Everything the sandboxed code prints lands in a [`CapturedLog`] instead of
//! the host's stdout/stderr, so a structured transport on those streams is
//! never corrupted.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity of a captured entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Trace,
    /// Notes written by the sandbox itself rather than by user code.
    Diagnostic,
}

impl LogLevel {
    /// Map a console method name to a level. Unknown names log at `Log`.
    pub fn from_console_method(name: &str) -> Self {
        match name {
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" | "assert" => LogLevel::Error,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            "diagnostic" => LogLevel::Diagnostic,
            _ => LogLevel::Log,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::Diagnostic => "diagnostic",
        };
        f.write_str(name)
    }
}

/// One timestamped line of captured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Whether the sandbox wrote this entry (as opposed to user code).
    pub fn is_diagnostic(&self) -> bool {
        self.level == LogLevel::Diagnostic
    }

    /// Render as a single `[timestamp] [level] message` line.
    pub fn line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            self.level,
            self.message
        )
    }
}

/// An append-only, ordered log shared between the isolate thread and the
/// watchdog.
#[derive(Clone, Debug, Default)]
pub struct CapturedLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl CapturedLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped with the current time.
    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        self.entries.lock().push(entry);
    }

    /// Append a sandbox-originated note.
    pub fn diagnostic(&self, message: impl Into<String>) {
        self.append(LogLevel::Diagnostic, message);
    }

    /// Copy out every entry in insertion order.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Render every entry as a line.
    pub fn lines(&self) -> Vec<String> {
        self.entries.lock().iter().map(LogEntry::line).collect()
    }

    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
