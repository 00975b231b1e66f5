//! Worker-internal diagnostics.
//!
//! The worker must report its own failures without re-entering the handler
//! it belongs to, so everything goes through a [`DiagnosticSink`] — by
//! default the host's `tracing` subscriber under the `logstash_async`
//! target. Hosts that route `tracing` back into this handler inject a
//! different sink to break the loop.
//!
//! Error reports are rate limited per fingerprint (see
//! [`crate::ratelimit`]); once shutdown begins the sink is bypassed in
//! favor of stderr, since the host logging system may already be tearing
//! down.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::ratelimit::ErrorRateLimiter;

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Destination for worker-internal messages. Shared between the facade
/// and the worker thread.
pub trait DiagnosticSink: Send + Sync {
    /// Emits one message. Must not call back into the handler.
    fn emit(&self, level: DiagLevel, message: &str);
}

/// Default sink: the host's `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, level: DiagLevel, message: &str) {
        match level {
            DiagLevel::Debug => tracing::debug!(target: "logstash_async", "{message}"),
            DiagLevel::Info => tracing::info!(target: "logstash_async", "{message}"),
            DiagLevel::Warn => tracing::warn!(target: "logstash_async", "{message}"),
            DiagLevel::Error => tracing::error!(target: "logstash_async", "{message}"),
        }
    }
}

/// Last-resort sink used while shutting down.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn emit(&self, level: DiagLevel, message: &str) {
        let tag = match level {
            DiagLevel::Debug => "DEBUG",
            DiagLevel::Info => "INFO",
            DiagLevel::Warn => "WARN",
            DiagLevel::Error => "ERROR",
        };
        eprintln!("logstash_async: {tag}: {message}");
    }
}

/// Rate-limited diagnostics handle held by the worker (and, with its own
/// limiter window, by the facade).
pub(crate) struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    limiter: ErrorRateLimiter,
    shutting_down: bool,
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticSink>, limiter: ErrorRateLimiter) -> Self {
        Diagnostics {
            sink,
            limiter,
            shutting_down: false,
        }
    }

    /// Reports a recurring error, subject to per-fingerprint rate limiting.
    pub fn report(&mut self, level: DiagLevel, fingerprint: &str, message: &str) {
        if self.shutting_down {
            StderrSink.emit(level, message);
            return;
        }
        let verdict = self.limiter.check(fingerprint);
        if !verdict.allowed {
            return;
        }
        let mut text = message.to_string();
        if verdict.resumed_after > 0 {
            let _ = write!(
                text,
                " ({} similar messages were dropped by rate limiting)",
                verdict.resumed_after
            );
        }
        if verdict.warn_throttling {
            text.push_str(
                " (further messages of this kind will be dropped for the remaining window)",
            );
        }
        self.sink.emit(level, &text);
    }

    /// Emits lifecycle chatter, bypassing the limiter.
    pub fn note(&mut self, level: DiagLevel, message: &str) {
        if self.shutting_down {
            StderrSink.emit(level, message);
        } else {
            self.sink.emit(level, message);
        }
    }

    /// Switches reporting to the stderr fallback for the rest of the
    /// worker's life.
    pub fn enter_shutdown(&mut self) {
        self.shutting_down = true;
    }
}
