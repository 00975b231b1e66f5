//! In-memory handoff between application threads and the worker.
//!
//! The queue is intentionally unbounded: blocking an application thread on
//! a full queue would defeat the whole point of the handler. Memory is
//! bounded in practice by the flush cadence, and by the durable buffer
//! being the real reservoir when persistence is on.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};

/// A formatted payload together with the time it was accepted.
#[derive(Debug, Clone)]
pub(crate) struct IntakeItem {
    pub payload: Bytes,
    pub intake_time: DateTime<Utc>,
}

/// Producer half, held by the handler facade and cloned per emitter.
#[derive(Debug, Clone)]
pub(crate) struct IntakeSender {
    tx: Sender<IntakeItem>,
}

impl IntakeSender {
    /// Non-blocking insert. Returns false when the worker is gone and the
    /// item was not accepted.
    pub fn push(&self, item: IntakeItem) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Consumer half, owned by the worker thread.
#[derive(Debug)]
pub(crate) struct IntakeQueue {
    rx: Receiver<IntakeItem>,
}

impl IntakeQueue {
    /// Returns up to `limit` items, waiting at most `max_wait` for the
    /// first one. Never waits once one item is available.
    pub fn drain_batch(&self, max_wait: Duration, limit: usize) -> Vec<IntakeItem> {
        let mut items = Vec::new();
        if limit == 0 {
            return items;
        }
        let first = if max_wait.is_zero() {
            self.rx.try_recv().ok()
        } else {
            self.rx.recv_timeout(max_wait).ok()
        };
        let Some(first) = first else {
            return items;
        };
        items.push(first);
        while items.len() < limit {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }

    /// Number of items currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Creates a connected sender/queue pair.
pub(crate) fn channel() -> (IntakeSender, IntakeQueue) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (IntakeSender { tx }, IntakeQueue { rx })
}
