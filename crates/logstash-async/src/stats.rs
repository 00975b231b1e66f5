//! Pipeline counters shared across the facade, worker, buffer and
//! transport.
//!
//! Counters are plain atomics; `snapshot` is what the host application
//! polls, typically from a metrics exporter or a health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters. One instance per handler, shared via `Arc`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    expired: AtomicU64,
    buffered: AtomicU64,
    bytes_sent: AtomicU64,
    transport_errors: AtomicU64,
    buffer_lock_conflicts: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, n: u64) {
        self.expired.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_buffered(&self, n: u64) {
        self.buffered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn remove_buffered(&self, n: u64) {
        // gauge, clamped at zero
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }

    pub(crate) fn record_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer_lock_conflict(&self) {
        self.buffer_lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            buffer_lock_conflicts: self.buffer_lock_conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Records accepted by `emit`.
    pub received: u64,
    /// Events written to the collector.
    pub sent: u64,
    /// Events dropped (format errors, buffer overflow, oversized payloads).
    pub dropped: u64,
    /// Events expired by TTL before transmission.
    pub expired: u64,
    /// Events currently held in the durable buffer.
    pub buffered: u64,
    /// Payload bytes written to the collector, framing included.
    pub bytes_sent: u64,
    /// Transport connect/send failures.
    pub transport_errors: u64,
    /// Times the durable buffer reported a lock conflict.
    pub buffer_lock_conflicts: u64,
}
