//! The background shipping worker.
//!
//! One thread drives the whole pipeline: drain the intake queue into the
//! durable buffer, expire rows past their TTL, claim a batch, transmit
//! it, and acknowledge or requeue. The loop sleeps on the control channel
//! until the earliest of the next queue check, the next flush deadline or
//! an explicit flush/shutdown signal.
//!
//! # Failure handling
//!
//! A failed transmission requeues the whole batch and arms an exponential
//! backoff (`min(cap, socket_timeout · 2^(n-1))` with ±50% jitter, capped
//! at `max(flush_interval, 60s)`). A locked buffer is never fatal: the
//! affected operation is retried on a later cycle, with undelivered
//! intake items carried over in memory and unacknowledged ids parked
//! until the lock clears.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rand::Rng;

use crate::buffer::EventBuffer;
use crate::config::Tunables;
use crate::diag::{DiagLevel, Diagnostics};
use crate::event::EventId;
use crate::intake::{IntakeItem, IntakeQueue};
use crate::stats::PipelineStats;
use crate::transport::{Transport, TransportError};

/// Caps `consecutive_failures` so the backoff shift cannot overflow.
const MAX_FAILURE_EXPONENT: u32 = 16;

/// Floor of the backoff cap, applied when `flush_interval` is shorter.
const BACKOFF_CAP_FLOOR: Duration = Duration::from_secs(60);

/// Signals from the facade to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    /// Flush queued events as soon as possible.
    Flush,
    /// Stop: final drain, final flush, close everything.
    Shutdown,
}

/// Everything the worker needs, bundled for [`ShipperWorker::new`].
pub(crate) struct WorkerParts {
    pub intake: IntakeQueue,
    pub control: Receiver<ControlMessage>,
    pub buffer: Box<dyn EventBuffer>,
    pub transport: Box<dyn Transport>,
    pub tunables: Tunables,
    pub event_ttl: Option<Duration>,
    pub stats: Arc<PipelineStats>,
    pub diag: Diagnostics,
}

pub(crate) struct ShipperWorker {
    intake: IntakeQueue,
    control: Receiver<ControlMessage>,
    buffer: Box<dyn EventBuffer>,
    transport: Box<dyn Transport>,
    tunables: Tunables,
    event_ttl: Option<Duration>,
    stats: Arc<PipelineStats>,
    diag: Diagnostics,

    flush_requested: bool,
    last_flush: Instant,
    last_queue_check: Instant,
    unflushed_count: usize,
    consecutive_failures: u32,
    backoff_deadline: Option<Instant>,
    carryover: VecDeque<IntakeItem>,
    deferred_acks: Vec<EventId>,
    deferred_requeues: Vec<EventId>,
}

impl ShipperWorker {
    pub fn new(parts: WorkerParts) -> Self {
        let now = Instant::now();
        ShipperWorker {
            intake: parts.intake,
            control: parts.control,
            buffer: parts.buffer,
            transport: parts.transport,
            tunables: parts.tunables,
            event_ttl: parts.event_ttl,
            stats: parts.stats,
            diag: parts.diag,
            flush_requested: false,
            last_flush: now,
            last_queue_check: now,
            unflushed_count: 0,
            consecutive_failures: 0,
            backoff_deadline: None,
            carryover: VecDeque::new(),
            deferred_acks: Vec::new(),
            deferred_requeues: Vec::new(),
        }
    }

    /// Starts the worker on its own named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("logstash-shipper".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        self.diag.note(DiagLevel::Debug, "shipping worker started");
        loop {
            match self.control.recv_timeout(self.next_wait()) {
                Ok(ControlMessage::Flush) => self.flush_requested = true,
                Ok(ControlMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.cycle();
        }
        self.shutdown();
    }

    /// Time until the next deadline worth waking up for.
    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        let queue_check = self.last_queue_check + self.tunables.queue_check_interval;
        let mut flush_at = if self.flush_requested {
            now
        } else {
            self.last_flush + self.tunables.flush_interval
        };
        if let Some(deadline) = self.backoff_deadline {
            flush_at = flush_at.max(deadline);
        }
        queue_check
            .min(flush_at)
            .saturating_duration_since(now)
    }

    /// One pass over steps 2–4: drain, expire, flush.
    fn cycle(&mut self) {
        self.retry_deferred();
        self.drain_intake();
        self.expire_events();
        self.maybe_flush(false);
    }

    /// Moves intake items (carryover first) into the durable buffer.
    fn drain_intake(&mut self) {
        self.last_queue_check = Instant::now();
        let limit = self.tunables.intake_drain_limit.max(1);
        let mut items = std::mem::take(&mut self.carryover);
        if items.len() < limit {
            items.extend(
                self.intake
                    .drain_batch(Duration::ZERO, limit - items.len()),
            );
        }

        while let Some(item) = items.pop_front() {
            match self.buffer.enqueue(&item.payload, item.intake_time) {
                Ok(_) => {
                    self.stats.add_buffered(1);
                    self.unflushed_count += 1;
                }
                Err(e) if e.is_retryable() => {
                    self.stats.record_buffer_lock_conflict();
                    self.diag.report(
                        DiagLevel::Debug,
                        e.fingerprint(),
                        &format!(
                            "event buffer is locked, will retry ({} events held back)",
                            items.len() + 1
                        ),
                    );
                    items.push_front(item);
                    break;
                }
                Err(e) => {
                    self.stats.record_dropped(1);
                    self.diag.report(
                        DiagLevel::Error,
                        e.fingerprint(),
                        &format!("dropping event: {e}"),
                    );
                }
            }
        }
        self.carryover = items;

        if self.unflushed_count >= self.tunables.flush_count {
            self.flush_requested = true;
        }
    }

    fn expire_events(&mut self) {
        let Some(ttl) = self.event_ttl else {
            return;
        };
        match self.buffer.expire(Utc::now(), ttl) {
            Ok(0) => {}
            Ok(expired) => {
                let expired = expired as u64;
                self.stats.record_expired(expired);
                self.stats.remove_buffered(expired);
                self.diag
                    .note(DiagLevel::Debug, &format!("expired {expired} events past ttl"));
            }
            Err(e) if e.is_retryable() => {
                // rows stay put; the next pass deletes them
                self.stats.record_buffer_lock_conflict();
            }
            Err(e) => self.diag.report(
                DiagLevel::Warn,
                e.fingerprint(),
                &format!("failed to expire events: {e}"),
            ),
        }
    }

    /// Claims a batch and transmits it when a flush is due. Returns true
    /// when a batch was delivered.
    fn maybe_flush(&mut self, force: bool) -> bool {
        if !force {
            let interval_elapsed =
                self.last_flush.elapsed() >= self.tunables.flush_interval;
            if !self.flush_requested && !interval_elapsed {
                return false;
            }
            if let Some(deadline) = self.backoff_deadline {
                if Instant::now() < deadline {
                    return false;
                }
            }
        }

        let batch = match self.buffer.claim_batch(self.tunables.flush_count) {
            Ok(batch) => batch,
            Err(e) if e.is_retryable() => {
                self.stats.record_buffer_lock_conflict();
                self.diag.report(
                    DiagLevel::Debug,
                    e.fingerprint(),
                    "event buffer is locked, deferring flush",
                );
                return false;
            }
            Err(e) => {
                self.diag.report(
                    DiagLevel::Error,
                    e.fingerprint(),
                    &format!("failed to read queued events: {e}"),
                );
                return false;
            }
        };

        if batch.is_empty() {
            self.finish_flush_cycle();
            return false;
        }

        let payloads: Vec<Bytes> = batch.iter().map(|event| event.payload.clone()).collect();
        let ids: Vec<EventId> = batch.iter().map(|event| event.id).collect();
        match self.transport.send(&payloads) {
            Ok(()) => {
                self.on_send_success(&ids);
                true
            }
            Err(e) => {
                self.on_send_failure(&ids, &e);
                false
            }
        }
    }

    fn finish_flush_cycle(&mut self) {
        self.flush_requested = false;
        self.unflushed_count = 0;
        self.last_flush = Instant::now();
    }

    fn on_send_success(&mut self, ids: &[EventId]) {
        let sent = ids.len() as u64;
        match self.buffer.ack(ids) {
            Ok(_) => {}
            Err(e) => {
                if e.is_retryable() {
                    self.stats.record_buffer_lock_conflict();
                } else {
                    self.diag.report(
                        DiagLevel::Warn,
                        e.fingerprint(),
                        &format!("failed to delete {sent} delivered events, will retry: {e}"),
                    );
                }
                self.deferred_acks.extend_from_slice(ids);
            }
        }
        self.stats.record_sent(sent);
        self.stats.remove_buffered(sent);
        self.consecutive_failures = 0;
        self.backoff_deadline = None;
        self.finish_flush_cycle();

        // keep draining the backlog on the next cycle
        if matches!(self.buffer.queued_len(), Ok(queued) if queued > 0) {
            self.flush_requested = true;
        }
    }

    fn on_send_failure(&mut self, ids: &[EventId], error: &TransportError) {
        self.transport.close();
        match self.buffer.requeue(ids) {
            Ok(_) => {}
            Err(e) => {
                if e.is_retryable() {
                    self.stats.record_buffer_lock_conflict();
                } else {
                    self.diag.report(
                        DiagLevel::Warn,
                        e.fingerprint(),
                        &format!("failed to requeue {} events, will retry: {e}", ids.len()),
                    );
                }
                self.deferred_requeues.extend_from_slice(ids);
            }
        }

        self.consecutive_failures = (self.consecutive_failures + 1).min(MAX_FAILURE_EXPONENT);
        let delay = backoff_delay(
            &self.tunables,
            self.consecutive_failures,
            rand::thread_rng().gen_range(0.5..1.5),
        );
        self.backoff_deadline = Some(Instant::now() + delay);

        let level = if error.is_config_error() {
            DiagLevel::Error
        } else {
            DiagLevel::Warn
        };
        self.diag.report(
            level,
            &error.fingerprint(),
            &format!(
                "failed to send {} events, next attempt in {:.1}s: {error}",
                ids.len(),
                delay.as_secs_f64()
            ),
        );
    }

    /// Replays acks/requeues that previously hit a locked buffer.
    fn retry_deferred(&mut self) {
        if !self.deferred_acks.is_empty() {
            let ids = std::mem::take(&mut self.deferred_acks);
            if let Err(e) = self.buffer.ack(&ids) {
                if e.is_retryable() {
                    self.stats.record_buffer_lock_conflict();
                }
                self.deferred_acks = ids;
            }
        }
        if !self.deferred_requeues.is_empty() {
            let ids = std::mem::take(&mut self.deferred_requeues);
            if let Err(e) = self.buffer.requeue(&ids) {
                if e.is_retryable() {
                    self.stats.record_buffer_lock_conflict();
                }
                self.deferred_requeues = ids;
            }
        }
    }

    fn shutdown(&mut self) {
        self.diag.enter_shutdown();
        self.retry_deferred();
        self.drain_intake_fully();
        self.final_flush();
        self.transport.close();
        self.buffer.close();
        self.warn_if_pending();
    }

    fn drain_intake_fully(&mut self) {
        while !self.intake.is_empty() || !self.carryover.is_empty() {
            let pending_before = self.intake.len() + self.carryover.len();
            self.drain_intake();
            if self.intake.len() + self.carryover.len() >= pending_before {
                break; // locked buffer, no progress to be made
            }
        }
    }

    /// Ships remaining batches until the buffer is empty or a send fails;
    /// attempted even when a backoff deadline is pending.
    fn final_flush(&mut self) {
        loop {
            if !self.maybe_flush(true) {
                break;
            }
            match self.buffer.queued_len() {
                Ok(queued) if queued > 0 => {}
                _ => break,
            }
        }
    }

    fn warn_if_pending(&mut self) {
        let pending = self.intake.len() + self.carryover.len();
        if pending > 0 {
            self.diag.note(
                DiagLevel::Warn,
                &format!(
                    "{pending} events were still queued at shutdown; this indicates an earlier error"
                ),
            );
        }
    }
}

/// Backoff after `failures` consecutive send errors, with the jitter
/// factor supplied by the caller.
fn backoff_delay(tunables: &Tunables, failures: u32, jitter: f64) -> Duration {
    let base = tunables.socket_timeout;
    let cap = tunables.flush_interval.max(BACKOFF_CAP_FLOOR);
    let failures = failures.clamp(1, MAX_FAILURE_EXPONENT);
    let exponential = base
        .checked_mul(1u32 << (failures - 1))
        .unwrap_or(cap)
        .min(cap);
    exponential.mul_f64(jitter.clamp(0.5, 1.5))
}
