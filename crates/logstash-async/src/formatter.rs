//! Rendering log records into Logstash-style JSON documents.
//!
//! The pipeline treats payloads as opaque bytes; everything schema-shaped
//! lives here. [`LogstashFormatter`] produces one single-line UTF-8 JSON
//! document per record — the transport appends the newline framing.
//!
//! # Document layout
//!
//! Reserved top-level fields are always emitted by the formatter itself:
//! `@timestamp`, `@version`, `host`, `level`, `logsource`, `message`,
//! `pid`, `program`, `type` and `tags`. Everything else (static `extra`
//! configuration plus per-record extras) lands in the extras namespace,
//! nested under `extra_prefix` or merged at the top level when the prefix
//! is empty. On a top-level merge, reserved fields win and the colliding
//! extra is discarded.

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::LogRecord;
use crate::hostname;

/// Top-level fields owned by the formatter; extras never overwrite them.
pub const RESERVED_FIELDS: &[&str] = &[
    "@timestamp",
    "@version",
    "host",
    "level",
    "logsource",
    "message",
    "pid",
    "port",
    "program",
    "type",
    "tags",
];

/// Record attribute names that must never leak into the extras namespace;
/// they are either reserved on the wire or carried structurally by
/// [`LogRecord`] itself.
pub const RECORD_FIELD_SKIP_LIST: &[&str] = &[
    "@timestamp",
    "@version",
    "host",
    "level",
    "logger",
    "logsource",
    "message",
    "pid",
    "port",
    "program",
    "severity",
    "timestamp",
    "type",
];

/// Error raised while rendering a record.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl FormatError {
    /// Stable key for rate-limiting repeated occurrences.
    #[must_use]
    pub fn fingerprint(&self) -> &'static str {
        match self {
            FormatError::Serialize(_) => "format.serialize",
        }
    }
}

/// Turns a [`LogRecord`] into the wire payload.
///
/// Implementations must produce a newline-free UTF-8 document; the
/// transport owns framing. Formatting runs on whichever application
/// thread emits the record, so implementations must be shareable and
/// should avoid I/O.
pub trait EventFormatter: Send + Sync {
    /// Renders one record.
    fn format(&self, record: &LogRecord) -> Result<Bytes, FormatError>;
}

/// Options for [`LogstashFormatter`].
#[derive(Debug, Clone)]
pub struct LogstashFormatterOptions {
    /// Value of the `type` field.
    pub message_type: String,
    /// Static tags merged into every event's `tags` list.
    pub tags: Vec<String>,
    /// Use the fully qualified domain name for `host` instead of the
    /// short hostname.
    pub fqdn: bool,
    /// Key the extras namespace nests under; an empty string merges
    /// extras at the top level (reserved fields win on collision).
    pub extra_prefix: String,
    /// Static fields merged into the extras namespace of every event.
    pub extra: Map<String, Value>,
    /// Escape non-ASCII characters as `\uXXXX` instead of emitting raw
    /// UTF-8.
    pub ensure_ascii: bool,
}

impl Default for LogstashFormatterOptions {
    fn default() -> Self {
        LogstashFormatterOptions {
            message_type: "rust-logstash".to_string(),
            tags: Vec::new(),
            fqdn: false,
            extra_prefix: "extra".to_string(),
            extra: Map::new(),
            ensure_ascii: false,
        }
    }
}

/// The reference formatter: Logstash `json` codec compatible documents.
pub struct LogstashFormatter {
    options: LogstashFormatterOptions,
    host: String,
    program: String,
    pid: u32,
}

impl Default for LogstashFormatter {
    fn default() -> Self {
        Self::new(LogstashFormatterOptions::default())
    }
}

impl LogstashFormatter {
    /// Builds a formatter, resolving hostname, program name and pid once.
    #[must_use]
    pub fn new(options: LogstashFormatterOptions) -> Self {
        let host = if options.fqdn {
            hostname::fqdn()
        } else {
            hostname::hostname()
        };
        LogstashFormatter {
            options,
            host,
            program: program_name(),
            pid: std::process::id(),
        }
    }

    fn extras_for(&self, record: &LogRecord) -> Map<String, Value> {
        let mut extras = self.options.extra.clone();
        extras.insert("logger".to_string(), Value::from(record.logger.clone()));
        if let Some(module) = &record.module_path {
            extras.insert("module".to_string(), Value::from(module.clone()));
        }
        if let Some(file) = &record.file {
            extras.insert("file".to_string(), Value::from(file.clone()));
        }
        if let Some(line) = record.line {
            extras.insert("line".to_string(), Value::from(line));
        }
        for (key, value) in &record.extras {
            if RECORD_FIELD_SKIP_LIST.contains(&key.as_str()) {
                continue;
            }
            extras.insert(key.clone(), value.clone());
        }
        extras
    }
}

impl EventFormatter for LogstashFormatter {
    fn format(&self, record: &LogRecord) -> Result<Bytes, FormatError> {
        let mut doc = Map::new();
        doc.insert(
            "@timestamp".to_string(),
            Value::from(record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        );
        doc.insert("@version".to_string(), Value::from("1"));
        doc.insert("host".to_string(), Value::from(self.host.clone()));
        doc.insert("level".to_string(), Value::from(record.severity.as_str()));
        doc.insert("logsource".to_string(), Value::from(self.host.clone()));
        doc.insert("message".to_string(), Value::from(record.message.clone()));
        doc.insert("pid".to_string(), Value::from(self.pid));
        doc.insert("program".to_string(), Value::from(self.program.clone()));
        doc.insert(
            "type".to_string(),
            Value::from(self.options.message_type.clone()),
        );
        doc.insert(
            "tags".to_string(),
            Value::Array(
                self.options
                    .tags
                    .iter()
                    .map(|t| Value::from(t.clone()))
                    .collect(),
            ),
        );

        let extras = self.extras_for(record);
        if self.options.extra_prefix.is_empty() {
            for (key, value) in extras {
                if RESERVED_FIELDS.contains(&key.as_str()) || doc.contains_key(&key) {
                    continue;
                }
                doc.insert(key, value);
            }
        } else if !extras.is_empty() {
            doc.insert(
                self.options.extra_prefix.clone(),
                Value::Object(extras),
            );
        }

        let mut rendered = serde_json::to_string(&Value::Object(doc))?;
        if self.options.ensure_ascii {
            rendered = escape_non_ascii(&rendered);
        }
        Ok(Bytes::from(rendered))
    }
}

fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Replaces every non-ASCII character with its `\uXXXX` escape.
///
/// Operates on serialized JSON; non-ASCII bytes can only occur inside
/// string literals there, so blind replacement is safe. Characters outside
/// the BMP become surrogate pairs, as JSON requires.
fn escape_non_ascii(json: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                // infallible: writing to a String
                let _ = write!(out, "\\u{unit:04x}");
            }
        }
    }
    out
}
