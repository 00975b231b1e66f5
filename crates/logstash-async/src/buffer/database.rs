//! SQLite-backed buffer backend.
//!
//! One table holds every pending event; `send_state` distinguishes rows
//! waiting for a batch from rows claimed by an in-progress transmission.
//! The schema is created on open and rows claimed by a previous process
//! life are reset, so a crash mid-flush degrades to at-least-once
//! delivery rather than loss.
//!
//! Statements that enumerate ids are chunked at `BufferLimits::chunk_size`
//! rows; SQLite bounds the number of variables a single statement may
//! carry.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};

use super::{ttl_cutoff_millis, BufferError, BufferLimits, EventBuffer, STATE_IN_FLIGHT, STATE_QUEUED};
use crate::event::{BufferedEvent, EventId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    payload       BLOB NOT NULL,
    pending_since INTEGER NOT NULL,
    send_state    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_send_state ON event (send_state);
CREATE INDEX IF NOT EXISTS idx_event_pending_since ON event (pending_since);
";

/// Durable buffer at a `database_path`.
pub struct SqliteBuffer {
    conn: Option<Connection>,
    path: PathBuf,
    limits: BufferLimits,
    stored: usize,
}

impl SqliteBuffer {
    /// Opens (creating if necessary) the buffer at `path` and resets any
    /// rows a previous process left `IN_FLIGHT`.
    pub fn open(
        path: impl Into<PathBuf>,
        timeout: Duration,
        limits: BufferLimits,
    ) -> Result<Self, BufferError> {
        let path = path.into();
        let conn = Connection::open(&path).map_err(|source| BufferError::Open {
            path: path.clone(),
            source,
        })?;
        conn.busy_timeout(timeout).map_err(map_sqlite)?;
        Self::initialize(conn, path, limits)
    }

    /// Opens a private in-memory database with the same schema; used by
    /// tests that want SQLite semantics without a file.
    pub fn in_memory(limits: BufferLimits) -> Result<Self, BufferError> {
        let conn = Connection::open_in_memory().map_err(BufferError::Storage)?;
        Self::initialize(conn, PathBuf::from(":memory:"), limits)
    }

    fn initialize(
        conn: Connection,
        path: PathBuf,
        limits: BufferLimits,
    ) -> Result<Self, BufferError> {
        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
        conn.execute(
            "UPDATE event SET send_state = ?1 WHERE send_state = ?2",
            params![STATE_QUEUED, STATE_IN_FLIGHT],
        )
        .map_err(map_sqlite)?;
        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM event", [], |row| row.get(0))
            .map_err(map_sqlite)?;
        Ok(SqliteBuffer {
            conn: Some(conn),
            path,
            limits,
            stored: usize::try_from(stored).unwrap_or(0),
        })
    }

    /// Location of the backing database file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn conn(&mut self) -> Result<&mut Connection, BufferError> {
        self.conn.as_mut().ok_or(BufferError::Closed)
    }

    fn run_chunked(
        conn: &Connection,
        sql_prefix: &str,
        ids: &[EventId],
        chunk_size: usize,
    ) -> Result<usize, BufferError> {
        let mut affected = 0;
        for chunk in ids.chunks(chunk_size.max(1)) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("{sql_prefix} ({placeholders})");
            affected += conn
                .execute(&sql, params_from_iter(chunk.iter()))
                .map_err(map_sqlite)?;
        }
        Ok(affected)
    }
}

impl EventBuffer for SqliteBuffer {
    fn enqueue(&mut self, payload: &Bytes, now: DateTime<Utc>) -> Result<EventId, BufferError> {
        if payload.len() > self.limits.max_payload_bytes {
            return Err(BufferError::PayloadTooLarge {
                size: payload.len(),
                max: self.limits.max_payload_bytes,
            });
        }
        if let Some(max) = self.limits.max_buffered_events {
            if self.stored >= max {
                return Err(BufferError::CapacityExhausted { max });
            }
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO event (payload, pending_since, send_state) VALUES (?1, ?2, ?3)",
            params![payload.as_ref(), now.timestamp_millis(), STATE_QUEUED],
        )
        .map_err(map_sqlite)?;
        let id = conn.last_insert_rowid();
        self.stored += 1;
        Ok(id)
    }

    fn claim_batch(&mut self, limit: usize) -> Result<Vec<BufferedEvent>, BufferError> {
        let chunk_size = self.limits.chunk_size;
        let conn = self.conn()?;
        let tx = conn.transaction().map_err(map_sqlite)?;

        let batch = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT id, payload FROM event WHERE send_state = ?1 \
                     ORDER BY id LIMIT ?2",
                )
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map(
                    params![STATE_QUEUED, i64::try_from(limit).unwrap_or(i64::MAX)],
                    |row| {
                        Ok(BufferedEvent {
                            id: row.get(0)?,
                            payload: Bytes::from(row.get::<_, Vec<u8>>(1)?),
                        })
                    },
                )
                .map_err(map_sqlite)?;
            let mut batch = Vec::new();
            for row in rows {
                batch.push(row.map_err(map_sqlite)?);
            }
            batch
        };

        if !batch.is_empty() {
            let ids: Vec<EventId> = batch.iter().map(|event| event.id).collect();
            let prefix = format!("UPDATE event SET send_state = {STATE_IN_FLIGHT} WHERE id IN");
            Self::run_chunked(&tx, &prefix, &ids, chunk_size)?;
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(batch)
    }

    fn ack(&mut self, ids: &[EventId]) -> Result<usize, BufferError> {
        let chunk_size = self.limits.chunk_size;
        let conn = self.conn()?;
        let removed = Self::run_chunked(conn, "DELETE FROM event WHERE id IN", ids, chunk_size)?;
        self.stored = self.stored.saturating_sub(removed);
        Ok(removed)
    }

    fn requeue(&mut self, ids: &[EventId]) -> Result<usize, BufferError> {
        let chunk_size = self.limits.chunk_size;
        let conn = self.conn()?;
        let prefix = format!("UPDATE event SET send_state = {STATE_QUEUED} WHERE id IN");
        Self::run_chunked(conn, &prefix, ids, chunk_size)
    }

    fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, BufferError> {
        let cutoff = ttl_cutoff_millis(now, ttl);
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM event WHERE pending_since < ?1",
                params![cutoff],
            )
            .map_err(map_sqlite)?;
        self.stored = self.stored.saturating_sub(removed);
        Ok(removed)
    }

    fn queued_len(&mut self) -> Result<usize, BufferError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event WHERE send_state = ?1",
                params![STATE_QUEUED],
                |row| row.get(0),
            )
            .map_err(map_sqlite)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            // close errors are unrecoverable here and deliberately dropped
            let _ = conn.close();
        }
    }
}

fn map_sqlite(e: rusqlite::Error) -> BufferError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return BufferError::Locked;
        }
    }
    BufferError::Storage(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BufferLimits {
        BufferLimits {
            chunk_size: 750,
            max_buffered_events: None,
            max_payload_bytes: 1024 * 1024,
        }
    }

    fn payload(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn enqueue_claim_ack_round_trip() {
        let mut buffer = SqliteBuffer::in_memory(limits()).unwrap();
        let now = Utc::now();
        for i in 0..5 {
            buffer.enqueue(&payload(&format!("e{i}")), now).unwrap();
        }
        assert_eq!(buffer.queued_len().unwrap(), 5);

        let batch = buffer.claim_batch(3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(&batch[0].payload[..], b"e0");
        assert_eq!(buffer.queued_len().unwrap(), 2);

        let ids: Vec<_> = batch.iter().map(|e| e.id).collect();
        assert_eq!(buffer.ack(&ids).unwrap(), 3);

        // remaining rows still claimable in order
        let rest = buffer.claim_batch(10).unwrap();
        assert_eq!(&rest[0].payload[..], b"e3");
        assert_eq!(&rest[1].payload[..], b"e4");
    }

    #[test]
    fn requeue_restores_claimed_rows() {
        let mut buffer = SqliteBuffer::in_memory(limits()).unwrap();
        buffer.enqueue(&payload("a"), Utc::now()).unwrap();
        buffer.enqueue(&payload("b"), Utc::now()).unwrap();

        let batch = buffer.claim_batch(10).unwrap();
        assert_eq!(buffer.queued_len().unwrap(), 0);

        let ids: Vec<_> = batch.iter().map(|e| e.id).collect();
        assert_eq!(buffer.requeue(&ids).unwrap(), 2);
        assert_eq!(buffer.queued_len().unwrap(), 2);
    }

    #[test]
    fn claim_ids_are_ascending() {
        let mut buffer = SqliteBuffer::in_memory(limits()).unwrap();
        for i in 0..10 {
            buffer.enqueue(&payload(&format!("{i}")), Utc::now()).unwrap();
        }
        let batch = buffer.claim_batch(10).unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn expire_deletes_old_rows() {
        let mut buffer = SqliteBuffer::in_memory(limits()).unwrap();
        let old = Utc::now() - chrono::Duration::seconds(3600);
        buffer.enqueue(&payload("stale"), old).unwrap();
        buffer.enqueue(&payload("fresh"), Utc::now()).unwrap();

        let removed = buffer
            .expire(Utc::now(), Duration::from_secs(600))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(buffer.queued_len().unwrap(), 1);
    }

    #[test]
    fn chunked_statements_handle_more_ids_than_chunk_size() {
        let mut small = limits();
        small.chunk_size = 3;
        let mut buffer = SqliteBuffer::in_memory(small).unwrap();
        for i in 0..10 {
            buffer.enqueue(&payload(&format!("{i}")), Utc::now()).unwrap();
        }
        let batch = buffer.claim_batch(10).unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id).collect();
        assert_eq!(buffer.ack(&ids).unwrap(), 10);
        assert_eq!(buffer.queued_len().unwrap(), 0);
    }

    #[test]
    fn payload_cap_is_enforced() {
        let mut tight = limits();
        tight.max_payload_bytes = 4;
        let mut buffer = SqliteBuffer::in_memory(tight).unwrap();
        assert!(matches!(
            buffer.enqueue(&payload("too large"), Utc::now()),
            Err(BufferError::PayloadTooLarge { size: 9, max: 4 })
        ));
    }

    #[test]
    fn capacity_counts_in_flight_rows() {
        let mut capped = limits();
        capped.max_buffered_events = Some(2);
        let mut buffer = SqliteBuffer::in_memory(capped).unwrap();
        buffer.enqueue(&payload("a"), Utc::now()).unwrap();
        buffer.enqueue(&payload("b"), Utc::now()).unwrap();
        let _ = buffer.claim_batch(1).unwrap();

        // a claimed row still occupies capacity
        assert!(matches!(
            buffer.enqueue(&payload("c"), Utc::now()),
            Err(BufferError::CapacityExhausted { max: 2 })
        ));
    }

    #[test]
    fn close_is_idempotent_and_rejects_use() {
        let mut buffer = SqliteBuffer::in_memory(limits()).unwrap();
        buffer.close();
        buffer.close();
        assert!(matches!(
            buffer.enqueue(&payload("x"), Utc::now()),
            Err(BufferError::Closed)
        ));
    }
}
