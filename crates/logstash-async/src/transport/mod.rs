//! Wire transports.
//!
//! A transport owns at most one connection to the collector and exposes
//! the minimal `{open, send, close}` capability set the worker drives.
//! Transports never retry internally: any send error closes the
//! connection, the worker requeues the batch, and the next `send`
//! reconnects.
//!
//! The reference implementation is [`TcpTransport`] (TCP, optionally
//! TLS). Alternative implementations are either registered by name (see
//! [`create`]) or handed to the handler as a boxed instance.

mod tcp;

pub use tcp::{TcpTransport, TlsOptions};

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::config::Config;
use crate::stats::PipelineStats;

/// Transport failure modes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no addresses resolved for {host}:{port}")]
    NoAddresses { host: String, port: u16 },
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{host} is not a valid TLS server name")]
    ServerName { host: String },
    #[error("failed to load certificates from {path:?}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("socket write failed: {source}")]
    Write {
        #[source]
        source: io::Error,
    },
    #[error("no transport registered under {0:?}")]
    UnknownTransport(String),
}

impl TransportError {
    /// Stable key for rate-limiting repeated occurrences. Variable parts
    /// (addresses, paths) are excluded; the I/O error kind is kept so
    /// e.g. refused connections and timeouts limit independently.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            TransportError::Resolve { source, .. } => {
                format!("transport.resolve.{:?}", source.kind())
            }
            TransportError::NoAddresses { .. } => "transport.resolve.empty".to_string(),
            TransportError::Connect { source, .. } => {
                format!("transport.connect.{:?}", source.kind())
            }
            TransportError::ServerName { .. } => "transport.tls.server_name".to_string(),
            TransportError::Certificate { .. } => "transport.tls.certificate".to_string(),
            TransportError::Tls(_) => "transport.tls.config".to_string(),
            TransportError::Handshake { source, .. } => {
                format!("transport.tls.handshake.{:?}", source.kind())
            }
            TransportError::Write { source } => {
                format!("transport.write.{:?}", source.kind())
            }
            TransportError::UnknownTransport(_) => "transport.unknown".to_string(),
        }
    }

    /// True for configuration-shaped failures that deserve a louder log
    /// than run-of-the-mill network churn.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TransportError::ServerName { .. }
                | TransportError::Certificate { .. }
                | TransportError::Tls(_)
                | TransportError::UnknownTransport(_)
        )
    }
}

/// A connection to the collector, owned by the worker thread.
pub trait Transport: Send {
    /// Establishes the connection if there is none. Idempotent.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Writes every payload followed by a newline, in order. A partial
    /// write fails the whole batch; the connection is closed on any
    /// error and the next call reconnects.
    fn send(&mut self, payloads: &[Bytes]) -> Result<(), TransportError>;

    /// Gracefully tears the connection down. Idempotent; errors are
    /// swallowed.
    fn close(&mut self);
}

/// Builds a registered transport by name.
///
/// Names replace the dynamic class loading other ecosystems use for
/// transport selection; `"tcp"` is the only built-in.
pub fn create(
    name: &str,
    config: &Config,
    stats: Arc<PipelineStats>,
) -> Result<Box<dyn Transport>, TransportError> {
    match name {
        "tcp" => Ok(Box::new(TcpTransport::from_config(config, stats))),
        other => Err(TransportError::UnknownTransport(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_tcp_only() {
        let config = Config::new("127.0.0.1", 5959);
        let stats = Arc::new(PipelineStats::default());
        assert!(create("tcp", &config, stats.clone()).is_ok());
        assert!(matches!(
            create("carrier-pigeon", &config, stats),
            Err(TransportError::UnknownTransport(_))
        ));
    }

    #[test]
    fn fingerprints_are_stable_and_variable_free() {
        let refused = TransportError::Connect {
            addr: "127.0.0.1:5959".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(refused.fingerprint(), "transport.connect.ConnectionRefused");

        let timeout = TransportError::Connect {
            addr: "10.0.0.1:5959".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        // different addresses, same kind → same fingerprint
        assert_ne!(refused.fingerprint(), timeout.fingerprint());
        assert_eq!(timeout.fingerprint(), "transport.connect.TimedOut");
    }

    #[test]
    fn config_errors_are_flagged() {
        assert!(TransportError::UnknownTransport("x".into()).is_config_error());
        assert!(!TransportError::Write {
            source: io::Error::from(io::ErrorKind::BrokenPipe)
        }
        .is_config_error());
    }
}
