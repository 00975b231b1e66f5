//! The public handler facade.
//!
//! [`AsyncLogstashHandler`] is what the host application talks to: it
//! formats records on the caller's thread, hands them to the worker via
//! the intake queue, and returns immediately. No call on this type ever
//! propagates an error back into application logging code — failures are
//! dropped, counted and reported through diagnostics instead.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::Sender;
use thiserror::Error;

use crate::buffer::{BufferError, BufferLimits, EventBuffer, MemoryBuffer, SqliteBuffer};
use crate::config::{Config, TransportSelection};
use crate::diag::{DiagLevel, Diagnostics, DiagnosticSink, TracingSink};
use crate::event::LogRecord;
use crate::formatter::{EventFormatter, LogstashFormatter};
use crate::intake::{self, IntakeItem, IntakeSender};
use crate::ratelimit::{ErrorRateLimiter, RateSpecError};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::transport::{self, TransportError};
use crate::worker::{ControlMessage, ShipperWorker, WorkerParts};

/// Error constructing a handler.
///
/// Construction is the only place this crate surfaces errors to the
/// host; a running handler never does.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    RateSpec(#[from] RateSpecError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Asynchronous log handler shipping events to a remote collector.
///
/// Dropping the handler closes it; [`close`](Self::close) can be called
/// earlier (and repeatedly) for a deterministic shutdown point.
pub struct AsyncLogstashHandler {
    enabled: bool,
    formatter: Box<dyn EventFormatter>,
    intake: IntakeSender,
    control: Sender<ControlMessage>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
    diag: Mutex<Diagnostics>,
}

impl AsyncLogstashHandler {
    /// Builds the pipeline and starts the worker thread.
    ///
    /// Uses the default [`TracingSink`] for worker diagnostics; hosts
    /// whose `tracing` output feeds back into this handler should use
    /// [`with_diagnostics`](Self::with_diagnostics) instead.
    pub fn new(config: Config) -> Result<Self, BuildError> {
        Self::with_diagnostics(config, Arc::new(TracingSink))
    }

    /// Like [`new`](Self::new), with an explicit diagnostic sink.
    pub fn with_diagnostics(
        mut config: Config,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, BuildError> {
        let tunables = config.tunables.clone();
        let stats = Arc::new(PipelineStats::default());

        let limits = BufferLimits::from_tunables(&tunables);
        let buffer: Box<dyn EventBuffer> = match &config.database_path {
            Some(path) => Box::new(SqliteBuffer::open(
                path,
                tunables.database_timeout,
                limits,
            )?),
            None => Box::new(MemoryBuffer::new(limits)),
        };

        let transport = match std::mem::take(&mut config.transport) {
            TransportSelection::Custom(transport) => transport,
            TransportSelection::Registry(name) => {
                transport::create(&name, &config, Arc::clone(&stats))?
            }
        };

        let formatter = config
            .formatter
            .take()
            .unwrap_or_else(|| Box::new(LogstashFormatter::default()));

        let rate_limit = tunables.error_log_rate_limit.as_deref();
        let worker_diag =
            Diagnostics::new(Arc::clone(&sink), ErrorRateLimiter::from_spec(rate_limit)?);
        let facade_diag = Diagnostics::new(sink, ErrorRateLimiter::from_spec(rate_limit)?);

        let (intake_tx, intake_rx) = intake::channel();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let worker = ShipperWorker::new(WorkerParts {
            intake: intake_rx,
            control: control_rx,
            buffer,
            transport,
            tunables,
            event_ttl: config.event_ttl,
            stats: Arc::clone(&stats),
            diag: worker_diag,
        })
        .spawn()
        .map_err(BuildError::Spawn)?;

        Ok(AsyncLogstashHandler {
            enabled: config.enable,
            formatter,
            intake: intake_tx,
            control: control_tx,
            worker: Some(worker),
            stats,
            diag: Mutex::new(facade_diag),
        })
    }

    /// Accepts one record. Never blocks on I/O and never fails the
    /// caller; a record that cannot be formatted or handed off is
    /// dropped, counted and reported.
    pub fn emit(&self, record: &LogRecord) {
        if !self.enabled {
            return;
        }
        self.stats.record_received(1);

        let payload = match self.formatter.format(record) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_dropped(1);
                self.report(
                    DiagLevel::Error,
                    e.fingerprint(),
                    &format!("dropping unformattable record: {e}"),
                );
                return;
            }
        };

        let accepted = self.intake.push(IntakeItem {
            payload,
            intake_time: Utc::now(),
        });
        if !accepted {
            self.stats.record_dropped(1);
            self.report(
                DiagLevel::Error,
                "handler.worker_gone",
                "dropping record: shipping worker is not running",
            );
        }
    }

    /// Requests a flush of everything queued. Best effort: returns
    /// immediately and gives no delivery guarantee.
    pub fn flush(&self) {
        let _ = self.control.send(ControlMessage::Flush);
    }

    /// Stops the worker: final intake drain, one last flush pass, then
    /// transport and buffer teardown. Idempotent.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.control.send(ControlMessage::Shutdown);
        if worker.join().is_err() {
            self.report(
                DiagLevel::Error,
                "handler.worker_panic",
                "shipping worker panicked during shutdown",
            );
        }
    }

    /// Point-in-time pipeline counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn report(&self, level: DiagLevel, fingerprint: &str, message: &str) {
        if let Ok(mut diag) = self.diag.lock() {
            diag.report(level, fingerprint, message);
        }
    }
}

impl Drop for AsyncLogstashHandler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    fn local_config(port: u16) -> Config {
        let mut config = Config::new("127.0.0.1", port);
        config.tunables.queue_check_interval = Duration::from_millis(20);
        config.tunables.flush_interval = Duration::from_millis(50);
        config
    }

    #[test]
    fn disabled_handler_drops_silently() {
        let config = local_config(1).enable(false);
        let mut handler = AsyncLogstashHandler::new(config).unwrap();
        handler.emit(&LogRecord::new(Severity::Info, "app", "ignored"));
        assert_eq!(handler.stats().received, 0);
        handler.close();
    }

    #[test]
    fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut handler = AsyncLogstashHandler::new(local_config(port)).unwrap();
        handler.close();
        handler.close();
    }

    #[test]
    fn records_flow_to_the_collector_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).unwrap();
            received
        });

        let mut handler = AsyncLogstashHandler::new(local_config(port)).unwrap();
        handler.emit(&LogRecord::new(Severity::Info, "app", "first"));
        handler.emit(&LogRecord::new(Severity::Info, "app", "second"));
        handler.close();

        let received = reader.join().unwrap();
        let lines: Vec<&str> = received.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["message"], "first");

        let stats = handler.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.buffered, 0);
    }
}
