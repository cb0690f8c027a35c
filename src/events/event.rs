//! # Per-connection debug-log lines.
//!
//! [`DebugLogEvent`] carries one categorized diagnostic line for one
//! connection. The [`DebugLogLevel`] separates host-generated markers from
//! forwarded process output:
//! - [`DebugLogLevel::System`] — lifecycle markers written by the host
//!   ("** Connection started **", …);
//! - [`DebugLogLevel::Console`] — forwarded stdout of the worker process;
//! - [`DebugLogLevel::Error`] — forwarded stderr and error diagnostics.

use std::time::SystemTime;

/// Category of a debug-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLogLevel {
    /// Lifecycle marker generated by the host itself.
    System,
    /// Forwarded stdout line of the worker process.
    Console,
    /// Forwarded stderr line or an error diagnostic.
    Error,
}

/// One diagnostic line for one connection.
#[derive(Debug, Clone)]
pub struct DebugLogEvent {
    /// Connection the line belongs to.
    pub connection_id: String,
    /// Line category.
    pub level: DebugLogLevel,
    /// The line itself, without trailing newline.
    pub line: String,
    /// Wall-clock timestamp at publish time.
    pub at: SystemTime,
}

impl DebugLogEvent {
    /// Creates an event stamped with the current wall-clock time.
    pub fn now(connection_id: impl Into<String>, level: DebugLogLevel, line: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            level,
            line: line.into(),
            at: SystemTime::now(),
        }
    }
}
