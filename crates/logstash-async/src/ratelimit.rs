//! Fixed-window rate limiting for worker-internal error messages.
//!
//! A transient network outage makes the worker fail every flush cycle; left
//! alone it would spam the host's own log with the same connect error every
//! few seconds. The limiter counts emissions per error fingerprint inside a
//! fixed window and suppresses the excess, reporting the suppressed count
//! once the fingerprint becomes eligible again.
//!
//! Rate specs use the `"<N> per <unit>"` notation, e.g. `"3 per minute"`.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

#[cfg(not(test))]
use std::time::Instant;

#[cfg(test)]
use mock_instant::global::Instant;

/// Buckets are swept for expired entries once the map grows past this.
const BUCKET_SWEEP_THRESHOLD: usize = 128;

/// Error parsing a `"<N> per <unit>"` rate spec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateSpecError {
    #[error("rate spec {0:?} does not match \"<N> per <unit>\"")]
    Malformed(String),
    #[error("rate spec count must be a positive integer, got {0:?}")]
    InvalidCount(String),
    #[error("unknown rate spec unit {0:?}, expected second, minute, hour or day")]
    InvalidUnit(String),
}

/// A parsed rate spec: at most `count` emissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    /// Maximum emissions per window.
    pub count: u64,
    /// Window length.
    pub window: Duration,
}

impl RateSpec {
    /// Parses `"<N> per <unit>"` with units `second`, `minute`, `hour`,
    /// `day` (a trailing `s` is accepted).
    pub fn parse(spec: &str) -> Result<Self, RateSpecError> {
        let mut parts = spec.split_whitespace();
        let (count, per, unit) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(count), Some(per), Some(unit), None) => (count, per, unit),
            _ => return Err(RateSpecError::Malformed(spec.to_string())),
        };
        if !per.eq_ignore_ascii_case("per") {
            return Err(RateSpecError::Malformed(spec.to_string()));
        }
        let count: u64 = count
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| RateSpecError::InvalidCount(count.to_string()))?;
        let unit_secs = match unit.to_ascii_lowercase().trim_end_matches('s') {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            "day" => 86_400,
            _ => return Err(RateSpecError::InvalidUnit(unit.to_string())),
        };
        Ok(RateSpec {
            count,
            window: Duration::from_secs(unit_secs),
        })
    }
}

/// Outcome of a limiter check for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the message may be emitted at all.
    pub allowed: bool,
    /// Set on the last allowed emission of a window; the caller should
    /// annotate the message so readers know the fingerprint goes quiet.
    pub warn_throttling: bool,
    /// Number of messages suppressed since the previous allowed emission
    /// of this fingerprint; non-zero exactly when suppression just ended.
    pub resumed_after: u64,
}

impl Verdict {
    const ALLOW: Verdict = Verdict {
        allowed: true,
        warn_throttling: false,
        resumed_after: 0,
    };
}

#[derive(Debug)]
struct Bucket {
    count: u64,
    window_start: Instant,
    suppressed: u64,
}

/// Per-fingerprint fixed-window limiter.
///
/// `None` spec means "no limiting": every check is allowed.
#[derive(Debug)]
pub struct ErrorRateLimiter {
    spec: Option<RateSpec>,
    buckets: HashMap<String, Bucket>,
}

impl ErrorRateLimiter {
    /// Creates a limiter; pass `None` to disable limiting entirely.
    #[must_use]
    pub fn new(spec: Option<RateSpec>) -> Self {
        ErrorRateLimiter {
            spec,
            buckets: HashMap::new(),
        }
    }

    /// Parses `spec` and builds a limiter from it; `None` disables.
    pub fn from_spec(spec: Option<&str>) -> Result<Self, RateSpecError> {
        let spec = spec.map(RateSpec::parse).transpose()?;
        Ok(Self::new(spec))
    }

    /// Checks whether a message with the given fingerprint may be emitted
    /// now, updating the window state.
    pub fn check(&mut self, fingerprint: &str) -> Verdict {
        let Some(spec) = self.spec else {
            return Verdict::ALLOW;
        };
        let now = Instant::now();
        self.maybe_sweep(now, spec.window);

        let bucket = self
            .buckets
            .entry(fingerprint.to_string())
            .or_insert_with(|| Bucket {
                count: 0,
                window_start: now,
                suppressed: 0,
            });

        if now.duration_since(bucket.window_start) >= spec.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count += 1;
        if bucket.count <= spec.count {
            Verdict {
                allowed: true,
                warn_throttling: bucket.count == spec.count,
                resumed_after: std::mem::take(&mut bucket.suppressed),
            }
        } else {
            bucket.suppressed += 1;
            Verdict {
                allowed: false,
                warn_throttling: false,
                resumed_after: 0,
            }
        }
    }

    /// Drops expired buckets with nothing left to report.
    fn maybe_sweep(&mut self, now: Instant, window: Duration) {
        if self.buckets.len() < BUCKET_SWEEP_THRESHOLD {
            return;
        }
        self.buckets
            .retain(|_, b| b.suppressed > 0 || now.duration_since(b.window_start) < window);
    }
}
