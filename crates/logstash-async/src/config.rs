//! Handler configuration and process-wide tunables.
//!
//! [`Config`] holds the per-handler options (endpoint, TLS, durability),
//! [`Tunables`] the pipeline constants (timeouts, cadences, batch sizes).
//! The worker captures an immutable snapshot of both when it starts;
//! mutating a `Tunables` value after handler construction has no effect on
//! a running pipeline.
//!
//! Tunables can be overridden from the environment before construction via
//! `LOGSTASH_ASYNC_*` variables (see [`Tunables::from_env`]). Invalid values
//! are ignored with a debug log rather than failing startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::formatter::EventFormatter;
use crate::transport::Transport;

/// Default TCP connect/read/write timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
/// Default cadence at which the intake queue is drained into the buffer.
pub const DEFAULT_QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Default maximum time between flush attempts.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Default batch-size flush trigger and `claim_batch` size.
pub const DEFAULT_FLUSH_COUNT: usize = 50;
/// Default maximum number of rows touched by a single SQL statement.
pub const DEFAULT_DATABASE_EVENT_CHUNK_SIZE: usize = 750;
/// Default SQLite busy timeout.
pub const DEFAULT_DATABASE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default cap on a single formatted payload accepted by the buffer.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Default cap on intake items persisted per worker cycle.
pub const DEFAULT_INTAKE_DRAIN_LIMIT: usize = 1000;

/// How the handler obtains its transport.
pub enum TransportSelection {
    /// Look the transport up in the registry by name (`"tcp"` by default).
    Registry(String),
    /// Use a caller-supplied transport instance.
    Custom(Box<dyn Transport>),
}

impl Default for TransportSelection {
    fn default() -> Self {
        TransportSelection::Registry("tcp".to_string())
    }
}

impl std::fmt::Debug for TransportSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportSelection::Registry(name) => {
                f.debug_tuple("Registry").field(name).finish()
            }
            TransportSelection::Custom(_) => f.debug_tuple("Custom").field(&"..").finish(),
        }
    }
}

/// Process-wide pipeline constants, captured by the worker at start.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// TCP connect/read/write timeout.
    pub socket_timeout: Duration,
    /// Intake drain cadence.
    pub queue_check_interval: Duration,
    /// Maximum time between flush attempts.
    pub flush_interval: Duration,
    /// Batch-size flush trigger; also the `claim_batch` size.
    pub flush_count: usize,
    /// Maximum rows per SQL statement when claiming, acking or requeueing.
    pub database_event_chunk_size: usize,
    /// SQLite busy timeout applied when opening the durable buffer.
    pub database_timeout: Duration,
    /// Rate spec (`"<N> per <unit>"`) limiting worker-internal error logs;
    /// `None` disables rate limiting.
    pub error_log_rate_limit: Option<String>,
    /// Optional cap on buffered events; inserts beyond it are dropped.
    pub max_buffered_events: Option<usize>,
    /// Payloads larger than this are rejected at enqueue and dropped.
    pub max_payload_bytes: usize,
    /// Soft cap on intake items persisted per worker cycle.
    pub intake_drain_limit: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            queue_check_interval: DEFAULT_QUEUE_CHECK_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_count: DEFAULT_FLUSH_COUNT,
            database_event_chunk_size: DEFAULT_DATABASE_EVENT_CHUNK_SIZE,
            database_timeout: DEFAULT_DATABASE_TIMEOUT,
            error_log_rate_limit: None,
            max_buffered_events: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            intake_drain_limit: DEFAULT_INTAKE_DRAIN_LIMIT,
        }
    }
}

impl Tunables {
    /// Builds tunables from defaults overridden by `LOGSTASH_ASYNC_*`
    /// environment variables.
    ///
    /// Recognized variables (durations are seconds, fractions allowed):
    /// `SOCKET_TIMEOUT`, `QUEUE_CHECK_INTERVAL`, `FLUSH_INTERVAL`,
    /// `FLUSH_COUNT`, `DATABASE_EVENT_CHUNK_SIZE`, `DATABASE_TIMEOUT`,
    /// `ERROR_LOG_RATE_LIMIT`, `MAX_BUFFERED_EVENTS`, `MAX_PAYLOAD_BYTES`,
    /// each prefixed with `LOGSTASH_ASYNC_`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut tunables = Tunables::default();
        if let Some(v) = env_duration("LOGSTASH_ASYNC_SOCKET_TIMEOUT") {
            tunables.socket_timeout = v;
        }
        if let Some(v) = env_duration("LOGSTASH_ASYNC_QUEUE_CHECK_INTERVAL") {
            tunables.queue_check_interval = v;
        }
        if let Some(v) = env_duration("LOGSTASH_ASYNC_FLUSH_INTERVAL") {
            tunables.flush_interval = v;
        }
        if let Some(v) = env_usize("LOGSTASH_ASYNC_FLUSH_COUNT") {
            tunables.flush_count = v.max(1);
        }
        if let Some(v) = env_usize("LOGSTASH_ASYNC_DATABASE_EVENT_CHUNK_SIZE") {
            tunables.database_event_chunk_size = v.max(1);
        }
        if let Some(v) = env_duration("LOGSTASH_ASYNC_DATABASE_TIMEOUT") {
            tunables.database_timeout = v;
        }
        if let Ok(v) = env::var("LOGSTASH_ASYNC_ERROR_LOG_RATE_LIMIT") {
            let v = v.trim();
            if !v.is_empty() {
                tunables.error_log_rate_limit = Some(v.to_string());
            }
        }
        if let Some(v) = env_usize("LOGSTASH_ASYNC_MAX_BUFFERED_EVENTS") {
            tunables.max_buffered_events = Some(v);
        }
        if let Some(v) = env_usize("LOGSTASH_ASYNC_MAX_PAYLOAD_BYTES") {
            tunables.max_payload_bytes = v.max(1);
        }
        tunables
    }
}

fn env_duration(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs > 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
        _ => {
            debug!("ignoring invalid value {raw:?} for {name}");
            None
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!("ignoring invalid value {raw:?} for {name}");
            None
        }
    }
}

/// Per-handler configuration.
///
/// Only `host` and `port` are required; everything else has a default
/// matching a plain-TCP, in-memory-buffered handler.
pub struct Config {
    /// Remote collector host.
    pub host: String,
    /// Remote collector port.
    pub port: u16,
    /// Durable buffer location; `None` keeps events in memory only.
    pub database_path: Option<PathBuf>,
    /// Transport implementation to use.
    pub transport: TransportSelection,
    /// Wrap the connection in TLS.
    pub ssl_enable: bool,
    /// Verify the server certificate chain (only meaningful with TLS).
    pub ssl_verify: bool,
    /// Client private key for mutual TLS.
    pub keyfile: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub certfile: Option<PathBuf>,
    /// Trust store; `None` uses the system store.
    pub ca_certs: Option<PathBuf>,
    /// When false, `emit` drops records silently.
    pub enable: bool,
    /// Buffered events older than this are expired without transmission.
    pub event_ttl: Option<Duration>,
    /// Formatter producing the wire payload; `None` uses
    /// [`LogstashFormatter`](crate::formatter::LogstashFormatter) defaults.
    pub formatter: Option<Box<dyn EventFormatter>>,
    /// Pipeline constants snapshot.
    pub tunables: Tunables,
}

impl Config {
    /// Creates a configuration for the given collector endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            database_path: None,
            transport: TransportSelection::default(),
            ssl_enable: false,
            ssl_verify: true,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            enable: true,
            event_ttl: None,
            formatter: None,
            tunables: Tunables::default(),
        }
    }

    /// Persist pending events at `path` so they survive restarts.
    #[must_use]
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Selects a registered transport by name.
    #[must_use]
    pub fn transport_name(mut self, name: impl Into<String>) -> Self {
        self.transport = TransportSelection::Registry(name.into());
        self
    }

    /// Supplies a caller-built transport instance.
    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = TransportSelection::Custom(transport);
        self
    }

    /// Enables TLS, verifying the server against `ca_certs` or the system
    /// trust store.
    #[must_use]
    pub fn ssl(mut self, verify: bool) -> Self {
        self.ssl_enable = true;
        self.ssl_verify = verify;
        self
    }

    /// Presents a client certificate during the TLS handshake.
    #[must_use]
    pub fn client_cert(mut self, certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        self.certfile = Some(certfile.into());
        self.keyfile = Some(keyfile.into());
        self
    }

    /// Uses `path` as the trust store instead of the system one.
    #[must_use]
    pub fn ca_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certs = Some(path.into());
        self
    }

    /// Enables or disables the handler as a whole.
    #[must_use]
    pub fn enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    /// Expires buffered events older than `ttl` without sending them.
    #[must_use]
    pub fn event_ttl(mut self, ttl: Duration) -> Self {
        self.event_ttl = Some(ttl);
        self
    }

    /// Replaces the default formatter.
    #[must_use]
    pub fn formatter(mut self, formatter: Box<dyn EventFormatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    /// Replaces the default tunables snapshot.
    #[must_use]
    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }
}
