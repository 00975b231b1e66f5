//! In-memory buffer backend.
//!
//! Same contract as the SQLite backend, nothing persisted: events are lost
//! when the process exits. Ids come from a plain counter so claim order
//! matches enqueue order.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{BufferError, BufferLimits, EventBuffer};
use crate::event::{BufferedEvent, EventId};

struct Row {
    payload: Bytes,
    pending_since: DateTime<Utc>,
    in_flight: bool,
}

/// Ordered-map buffer for handlers configured without a database path.
pub struct MemoryBuffer {
    rows: BTreeMap<EventId, Row>,
    next_id: EventId,
    limits: BufferLimits,
    closed: bool,
}

impl MemoryBuffer {
    #[must_use]
    pub fn new(limits: BufferLimits) -> Self {
        MemoryBuffer {
            rows: BTreeMap::new(),
            next_id: 1,
            limits,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), BufferError> {
        if self.closed {
            Err(BufferError::Closed)
        } else {
            Ok(())
        }
    }
}

impl EventBuffer for MemoryBuffer {
    fn enqueue(&mut self, payload: &Bytes, now: DateTime<Utc>) -> Result<EventId, BufferError> {
        self.ensure_open()?;
        if payload.len() > self.limits.max_payload_bytes {
            return Err(BufferError::PayloadTooLarge {
                size: payload.len(),
                max: self.limits.max_payload_bytes,
            });
        }
        if let Some(max) = self.limits.max_buffered_events {
            if self.rows.len() >= max {
                return Err(BufferError::CapacityExhausted { max });
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.rows.insert(
            id,
            Row {
                payload: payload.clone(),
                pending_since: now,
                in_flight: false,
            },
        );
        Ok(id)
    }

    fn claim_batch(&mut self, limit: usize) -> Result<Vec<BufferedEvent>, BufferError> {
        self.ensure_open()?;
        let claimed: Vec<EventId> = self
            .rows
            .iter()
            .filter(|(_, row)| !row.in_flight)
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        let mut batch = Vec::with_capacity(claimed.len());
        for id in claimed {
            let row = self.rows.get_mut(&id).ok_or(BufferError::Closed)?;
            row.in_flight = true;
            batch.push(BufferedEvent {
                id,
                payload: row.payload.clone(),
            });
        }
        Ok(batch)
    }

    fn ack(&mut self, ids: &[EventId]) -> Result<usize, BufferError> {
        self.ensure_open()?;
        let mut removed = 0;
        for id in ids {
            if self.rows.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn requeue(&mut self, ids: &[EventId]) -> Result<usize, BufferError> {
        self.ensure_open()?;
        let mut restored = 0;
        for id in ids {
            if let Some(row) = self.rows.get_mut(id) {
                if row.in_flight {
                    row.in_flight = false;
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }

    fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, BufferError> {
        self.ensure_open()?;
        let cutoff = super::ttl_cutoff_millis(now, ttl);
        let before = self.rows.len();
        self.rows
            .retain(|_, row| row.pending_since.timestamp_millis() >= cutoff);
        Ok(before - self.rows.len())
    }

    fn queued_len(&mut self) -> Result<usize, BufferError> {
        self.ensure_open()?;
        Ok(self.rows.values().filter(|row| !row.in_flight).count())
    }

    fn close(&mut self) {
        self.rows.clear();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BufferLimits {
        BufferLimits {
            chunk_size: 750,
            max_buffered_events: None,
            max_payload_bytes: 1024,
        }
    }

    fn payload(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn claim_returns_fifo_order_and_marks_in_flight() {
        let mut buffer = MemoryBuffer::new(limits());
        for i in 0..4 {
            buffer.enqueue(&payload(&format!("e{i}")), Utc::now()).unwrap();
        }

        let batch = buffer.claim_batch(2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(&batch[0].payload[..], b"e0");
        assert_eq!(&batch[1].payload[..], b"e1");

        // claimed rows are invisible to the next claim
        let rest = buffer.claim_batch(10).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(&rest[0].payload[..], b"e2");
        assert_eq!(buffer.queued_len().unwrap(), 0);
    }

    #[test]
    fn ack_deletes_and_requeue_restores() {
        let mut buffer = MemoryBuffer::new(limits());
        for i in 0..3 {
            buffer.enqueue(&payload(&format!("e{i}")), Utc::now()).unwrap();
        }
        let batch = buffer.claim_batch(3).unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id).collect();

        assert_eq!(buffer.requeue(&ids[..2]).unwrap(), 2);
        assert_eq!(buffer.queued_len().unwrap(), 2);

        assert_eq!(buffer.ack(&ids[2..]).unwrap(), 1);
        let remaining = buffer.claim_batch(10).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn requeue_of_unknown_id_is_ignored() {
        let mut buffer = MemoryBuffer::new(limits());
        assert_eq!(buffer.requeue(&[99]).unwrap(), 0);
        assert_eq!(buffer.ack(&[99]).unwrap(), 0);
    }

    #[test]
    fn expire_removes_old_rows_only() {
        let mut buffer = MemoryBuffer::new(limits());
        let old = Utc::now() - chrono::Duration::seconds(120);
        buffer.enqueue(&payload("old"), old).unwrap();
        buffer.enqueue(&payload("fresh"), Utc::now()).unwrap();

        let removed = buffer.expire(Utc::now(), Duration::from_secs(60)).unwrap();
        assert_eq!(removed, 1);
        let batch = buffer.claim_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0].payload[..], b"fresh");
    }

    #[test]
    fn payload_and_capacity_limits_are_enforced() {
        let mut limits = limits();
        limits.max_buffered_events = Some(1);
        limits.max_payload_bytes = 8;
        let mut buffer = MemoryBuffer::new(limits);

        assert!(matches!(
            buffer.enqueue(&payload("way too large payload"), Utc::now()),
            Err(BufferError::PayloadTooLarge { .. })
        ));

        buffer.enqueue(&payload("ok"), Utc::now()).unwrap();
        assert!(matches!(
            buffer.enqueue(&payload("two"), Utc::now()),
            Err(BufferError::CapacityExhausted { max: 1 })
        ));
    }

    #[test]
    fn close_rejects_further_operations() {
        let mut buffer = MemoryBuffer::new(limits());
        buffer.close();
        assert!(matches!(
            buffer.enqueue(&payload("x"), Utc::now()),
            Err(BufferError::Closed)
        ));
    }
}
