//! Reference TCP transport with optional TLS.
//!
//! Events are framed as newline-delimited documents on a single
//! long-lived connection; there is no length prefix, no acknowledgement
//! and no reverse traffic. Success means every byte was handed to the OS
//! without a socket error before the batch completed — the canonical
//! consumer is a Logstash `tcp` input with the `json` codec.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};

use super::{Transport, TransportError};
use crate::config::Config;
use crate::stats::PipelineStats;

/// TLS settings for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify the server certificate chain.
    pub verify: bool,
    /// Client private key (PEM) for mutual TLS.
    pub keyfile: Option<PathBuf>,
    /// Client certificate chain (PEM) for mutual TLS.
    pub certfile: Option<PathBuf>,
    /// Trust store (PEM); `None` uses the system store.
    pub ca_certs: Option<PathBuf>,
}

enum Socket {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(stream) => stream.write(buf),
            Socket::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Plain(stream) => stream.flush(),
            Socket::Tls(stream) => stream.flush(),
        }
    }
}

/// TCP (optionally TLS) connection to the collector.
pub struct TcpTransport {
    host: String,
    port: u16,
    socket_timeout: Duration,
    tls: Option<TlsOptions>,
    tls_config: Option<Arc<ClientConfig>>,
    socket: Option<Socket>,
    stats: Arc<PipelineStats>,
}

impl TcpTransport {
    /// Creates a disconnected transport; the first `send` connects.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        socket_timeout: Duration,
        tls: Option<TlsOptions>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        TcpTransport {
            host: host.into(),
            port,
            socket_timeout,
            tls,
            tls_config: None,
            socket: None,
            stats,
        }
    }

    pub(crate) fn from_config(config: &Config, stats: Arc<PipelineStats>) -> Self {
        let tls = config.ssl_enable.then(|| TlsOptions {
            verify: config.ssl_verify,
            keyfile: config.keyfile.clone(),
            certfile: config.certfile.clone(),
            ca_certs: config.ca_certs.clone(),
        });
        Self::new(
            config.host.clone(),
            config.port,
            config.tunables.socket_timeout,
            tls,
            stats,
        )
    }

    fn connect_tcp(&self) -> Result<TcpStream, TransportError> {
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                host: self.host.clone(),
                port: self.port,
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::NoAddresses {
                host: self.host.clone(),
                port: self.port,
            });
        }

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.socket_timeout) {
                Ok(stream) => {
                    let _ = stream.set_read_timeout(Some(self.socket_timeout));
                    let _ = stream.set_write_timeout(Some(self.socket_timeout));
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(source) => last_error = Some(TransportError::Connect { addr, source }),
            }
        }
        // non-empty addrs guarantees a recorded error here
        Err(last_error.unwrap_or(TransportError::NoAddresses {
            host: self.host.clone(),
            port: self.port,
        }))
    }

    fn wrap_tls(&mut self, tcp: TcpStream) -> Result<Socket, TransportError> {
        let tls_config = match &self.tls_config {
            Some(config) => Arc::clone(config),
            None => {
                // options are only consulted when TLS is enabled
                let Some(options) = self.tls.clone() else {
                    return Ok(Socket::Plain(tcp));
                };
                let config = Arc::new(build_client_config(&options)?);
                self.tls_config = Some(Arc::clone(&config));
                config
            }
        };

        let server_name = ServerName::try_from(self.host.clone()).map_err(|_| {
            TransportError::ServerName {
                host: self.host.clone(),
            }
        })?;
        let connection = ClientConnection::new(tls_config, server_name)?;
        let mut stream = StreamOwned::new(connection, tcp);

        // drive the handshake to completion so verification failures
        // surface at connect time, not on the first write
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|source| TransportError::Handshake {
                    host: self.host.clone(),
                    source,
                })?;
        }
        Ok(Socket::Tls(Box::new(stream)))
    }

    fn write_batch(socket: &mut Socket, payloads: &[Bytes]) -> io::Result<u64> {
        let mut written = 0u64;
        for payload in payloads {
            socket.write_all(payload)?;
            socket.write_all(b"\n")?;
            written += payload.len() as u64 + 1;
        }
        socket.flush()?;
        Ok(written)
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let tcp = self.connect_tcp()?;
        let socket = if self.tls.is_some() {
            self.wrap_tls(tcp)?
        } else {
            Socket::Plain(tcp)
        };
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, payloads: &[Bytes]) -> Result<(), TransportError> {
        if let Err(e) = self.open() {
            self.stats.record_transport_error();
            return Err(e);
        }
        // open() just succeeded
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        match Self::write_batch(socket, payloads) {
            Ok(bytes) => {
                self.stats.record_bytes_sent(bytes);
                Ok(())
            }
            Err(source) => {
                self.stats.record_transport_error();
                self.close();
                Err(TransportError::Write { source })
            }
        }
    }

    fn close(&mut self) {
        match self.socket.take() {
            Some(Socket::Plain(stream)) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Some(Socket::Tls(mut stream)) => {
                stream.conn.send_close_notify();
                let _ = stream.flush();
                let _ = stream.sock.shutdown(Shutdown::Both);
            }
            None => {}
        }
    }
}

fn build_client_config(options: &TlsOptions) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    if let Some(path) = &options.ca_certs {
        for cert in read_certs(path)? {
            roots.add(cert)?;
        }
    } else {
        // unreadable individual system certs are skipped, as everywhere
        let result = rustls_native_certs::load_native_certs();
        for cert in result.certs {
            let _ = roots.add(cert);
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (&options.certfile, &options.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let certs = read_certs(certfile)?;
            let key = read_private_key(keyfile)?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };

    if !options.verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }
    Ok(config)
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::Certificate {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TransportError::Certificate {
            path: path.to_path_buf(),
            source,
        })
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::Certificate {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TransportError::Certificate {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TransportError::Certificate {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, "no private key found"),
        })
}

/// Accept-everything verifier behind `ssl_verify = false`.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn transport_for(addr: std::net::SocketAddr) -> TcpTransport {
        TcpTransport::new(
            addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(1),
            None,
            Arc::new(PipelineStats::default()),
        )
    }

    fn payload(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn sends_newline_framed_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).unwrap();
            received
        });

        let mut transport = transport_for(addr);
        transport
            .send(&[payload(r#"{"message":"a"}"#), payload(r#"{"message":"b"}"#)])
            .unwrap();
        transport.close();

        let received = reader.join().unwrap();
        assert_eq!(received, "{\"message\":\"a\"}\n{\"message\":\"b\"}\n");
    }

    #[test]
    fn connection_is_reused_across_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).unwrap();
            received.lines().count()
        });

        let mut transport = transport_for(addr);
        transport.send(&[payload("one")]).unwrap();
        transport.send(&[payload("two")]).unwrap();
        transport.close();

        // both batches arrived over the single accepted connection
        assert_eq!(reader.join().unwrap(), 2);
    }

    #[test]
    fn connect_refused_is_reported() {
        // bind and drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let stats = Arc::new(PipelineStats::default());
        let mut transport = TcpTransport::new(
            addr.ip().to_string(),
            addr.port(),
            Duration::from_millis(200),
            None,
            Arc::clone(&stats),
        );
        let err = transport.send(&[payload("x")]).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(stats.snapshot().transport_errors, 1);
    }

    #[test]
    fn close_without_connection_is_a_noop() {
        let addr = "127.0.0.1:9".parse().unwrap();
        let mut transport = transport_for(addr);
        transport.close();
        transport.close();
    }
}
