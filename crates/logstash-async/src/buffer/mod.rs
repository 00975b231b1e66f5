//! Durable buffering of pending events.
//!
//! The buffer is the pipeline's reservoir: everything accepted by the
//! handler sits here until it is acknowledged by the collector or expired
//! by TTL. Two backends share one contract — [`SqliteBuffer`] persists
//! rows across process restarts, [`MemoryBuffer`] holds them in an ordered
//! map for hosts that opt out of durability.
//!
//! # Row state machine
//!
//! A row is `QUEUED` from enqueue until a worker cycle claims it
//! (`IN_FLIGHT`), then either deleted on ack or flipped back to `QUEUED`
//! on requeue. The only other exit is TTL expiry. A process that dies with
//! rows `IN_FLIGHT` leaves them to the next startup, which resets every
//! `IN_FLIGHT` row to `QUEUED` before the first claim.

mod database;
mod memory;

pub use database::SqliteBuffer;
pub use memory::MemoryBuffer;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::{BufferedEvent, EventId};

/// Buffer failure modes.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to open event buffer at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    /// Another process holds the store's lock; the operation can be
    /// retried on a later cycle.
    #[error("event buffer is locked")]
    Locked,
    #[error("event buffer operation failed: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("event buffer capacity of {max} events reached")]
    CapacityExhausted { max: usize },
    #[error("event buffer is closed")]
    Closed,
}

impl BufferError {
    /// Stable key for rate-limiting repeated occurrences.
    #[must_use]
    pub fn fingerprint(&self) -> &'static str {
        match self {
            BufferError::Open { .. } => "buffer.open",
            BufferError::Locked => "buffer.locked",
            BufferError::Storage(_) => "buffer.storage",
            BufferError::PayloadTooLarge { .. } => "buffer.payload_too_large",
            BufferError::CapacityExhausted { .. } => "buffer.capacity",
            BufferError::Closed => "buffer.closed",
        }
    }

    /// True for conditions worth retrying on the next cycle rather than
    /// treating as a lost write.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BufferError::Locked)
    }
}

/// Size limits shared by both backends.
#[derive(Debug, Clone)]
pub struct BufferLimits {
    /// Maximum rows touched by one statement when claiming, acking or
    /// requeueing.
    pub chunk_size: usize,
    /// Optional cap on stored events; `enqueue` fails with
    /// [`BufferError::CapacityExhausted`] beyond it.
    pub max_buffered_events: Option<usize>,
    /// Payloads larger than this are rejected with
    /// [`BufferError::PayloadTooLarge`].
    pub max_payload_bytes: usize,
}

impl BufferLimits {
    pub(crate) fn from_tunables(tunables: &crate::config::Tunables) -> Self {
        BufferLimits {
            chunk_size: tunables.database_event_chunk_size.max(1),
            max_buffered_events: tunables.max_buffered_events,
            max_payload_bytes: tunables.max_payload_bytes,
        }
    }
}

/// Persistent FIFO of pending events. The worker thread is the sole
/// caller; implementations need not tolerate concurrent use.
pub trait EventBuffer: Send {
    /// Inserts a payload as a new `QUEUED` row and returns its id.
    fn enqueue(&mut self, payload: &Bytes, now: DateTime<Utc>) -> Result<EventId, BufferError>;

    /// Claims up to `limit` `QUEUED` rows in ascending id order, flipping
    /// them to `IN_FLIGHT`.
    fn claim_batch(&mut self, limit: usize) -> Result<Vec<BufferedEvent>, BufferError>;

    /// Deletes acknowledged rows. Returns the number actually removed.
    fn ack(&mut self, ids: &[EventId]) -> Result<usize, BufferError>;

    /// Returns claimed rows to `QUEUED` after a failed transmission.
    fn requeue(&mut self, ids: &[EventId]) -> Result<usize, BufferError>;

    /// Deletes rows older than `ttl`, regardless of state. Returns the
    /// number removed.
    fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, BufferError>;

    /// Number of `QUEUED` rows.
    fn queued_len(&mut self) -> Result<usize, BufferError>;

    /// Releases the backing store. Idempotent; later calls fail with
    /// [`BufferError::Closed`].
    fn close(&mut self);
}

/// Row states as stored on disk.
pub(crate) const STATE_QUEUED: i64 = 0;
pub(crate) const STATE_IN_FLIGHT: i64 = 1;

pub(crate) fn ttl_cutoff_millis(now: DateTime<Utc>, ttl: Duration) -> i64 {
    now.timestamp_millis() - i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
