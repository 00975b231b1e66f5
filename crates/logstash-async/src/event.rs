//! Log records and buffered event types.
//!
//! A [`LogRecord`] is what the host application hands to the handler; the
//! formatter turns it into an opaque payload which then travels through the
//! intake queue and the durable buffer as a [`BufferedEvent`].

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Identifier assigned to an event when it enters the durable buffer.
///
/// Ids are monotonically increasing within one buffer lifetime; the SQLite
/// backend uses the rowid, the in-memory backend a plain counter.
pub type EventId = i64;

/// Severity of a log record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Upper-case name as it appears in the `level` field on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log record as emitted by the host application.
///
/// The handler never inspects the record beyond passing it to the
/// formatter, so hosts are free to populate only the fields their logging
/// framework knows about.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Record severity.
    pub severity: Severity,
    /// Name of the emitting logger (module path, component name, ...).
    pub logger: String,
    /// The rendered log message.
    pub message: String,
    /// Module path of the emitting code, if known.
    pub module_path: Option<String>,
    /// Source file of the emitting code, if known.
    pub file: Option<String>,
    /// Source line of the emitting code, if known.
    pub line: Option<u32>,
    /// Wall-clock time the record was created.
    pub timestamp: DateTime<Utc>,
    /// Per-record extra fields, merged into the event's extras namespace.
    pub extras: BTreeMap<String, Value>,
}

impl LogRecord {
    /// Creates a record with the current wall-clock time and no extras.
    pub fn new(
        severity: Severity,
        logger: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LogRecord {
            severity,
            logger: logger.into(),
            message: message.into(),
            module_path: None,
            file: None,
            line: None,
            timestamp: Utc::now(),
            extras: BTreeMap::new(),
        }
    }

    /// Attaches an extra field to the record.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Sets the source location of the record.
    #[must_use]
    pub fn with_location(
        mut self,
        module_path: impl Into<String>,
        file: impl Into<String>,
        line: u32,
    ) -> Self {
        self.module_path = Some(module_path.into());
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

/// A formatted event claimed from the durable buffer for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEvent {
    /// Buffer-assigned id, used to ack or requeue the row.
    pub id: EventId,
    /// The formatted payload, without the trailing newline.
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_names_are_upper_case() {
        assert_eq!(Severity::Info.as_str(), "INFO");
        assert_eq!(Severity::Warning.as_str(), "WARNING");
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Trace < Severity::Debug);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn record_builder_attaches_extras_and_location() {
        let record = LogRecord::new(Severity::Info, "app.db", "query done")
            .with_extra("rows", 42)
            .with_location("app::db", "src/db.rs", 17);

        assert_eq!(record.extras.get("rows"), Some(&Value::from(42)));
        assert_eq!(record.module_path.as_deref(), Some("app::db"));
        assert_eq!(record.line, Some(17));
    }
}
