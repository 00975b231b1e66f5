//! Asynchronous, durable log shipping to Logstash-style collectors.
//!
//! The handler accepts log records on the application's threads, returns
//! immediately, and ships them as newline-delimited JSON over TCP
//! (optionally TLS) from a single background worker. With a
//! `database_path` configured, pending events sit in an embedded SQLite
//! buffer and survive process restarts and collector outages.
//!
//! # Architecture
//!
//! ```text
//!  app threads            worker thread
//!      │                       │
//!      v                       v
//!  ┌────────┐  format   ┌─────────────┐   claim    ┌───────────┐
//!  │ emit() │ ────────> │ intake queue│ ─────────> │  durable  │
//!  └────────┘           └─────────────┘   persist  │  buffer   │
//!                                                  └─────┬─────┘
//!                                                        │ batch
//!                                                        v
//!                                                  ┌───────────┐
//!                                                  │ transport │──> collector
//!                                                  └───────────┘
//! ```
//!
//! Delivery is at-least-once: a batch is deleted from the buffer only
//! after the transport reports success, and a crash mid-flight requeues
//! the batch on the next startup. Transmission failures back off
//! exponentially with jitter; worker-internal errors are reported through
//! `tracing` (or a custom [`DiagnosticSink`]) with per-fingerprint rate
//! limiting.
//!
//! # Example
//!
//! ```rust,no_run
//! use logstash_async::{AsyncLogstashHandler, Config, LogRecord, Severity};
//!
//! # fn main() -> Result<(), logstash_async::BuildError> {
//! let mut handler = AsyncLogstashHandler::new(
//!     Config::new("logs.example.com", 5959).database_path("/var/lib/app/events.db"),
//! )?;
//!
//! handler.emit(&LogRecord::new(Severity::Info, "app", "service started"));
//! handler.flush();
//! handler.close();
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod buffer;
pub mod config;
pub mod diag;
pub mod event;
pub mod formatter;
pub mod ratelimit;
pub mod stats;
pub mod transport;

mod handler;
mod hostname;
mod intake;
mod worker;

pub use buffer::{BufferError, BufferLimits, EventBuffer, MemoryBuffer, SqliteBuffer};
pub use config::{Config, TransportSelection, Tunables};
pub use diag::{DiagLevel, DiagnosticSink, StderrSink, TracingSink};
pub use event::{BufferedEvent, EventId, LogRecord, Severity};
pub use formatter::{
    EventFormatter, FormatError, LogstashFormatter, LogstashFormatterOptions,
};
pub use handler::{AsyncLogstashHandler, BuildError};
pub use ratelimit::{ErrorRateLimiter, RateSpec, RateSpecError, Verdict};
pub use stats::{PipelineStats, StatsSnapshot};
pub use transport::{TcpTransport, TlsOptions, Transport, TransportError};
