//! Secure-transport bridge
//!
//! The embedded handshake library expects a reliable byte stream, but
//! underneath there is only the control channel. The bridge glues the two
//! together: one end of an in-memory duplex pipe goes to the handshake
//! library, while pump tasks shuttle bytes between the other end and the
//! reliable transport, chunking outbound writes so each fits a single
//! control packet payload.
//!
//! This module also builds the rustls client configuration from the
//! engine's credentials.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::config::Config;

/// Secure-transport errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate verification against the configured roots failed.
    #[error("bad certificate chain: {0}")]
    BadCertChain(String),

    /// The handshake failed for a reason other than certificates.
    #[error("tls handshake failed: {0}")]
    BadHandshake(String),

    #[error("bad tls config: {0}")]
    BadConfig(String),

    /// The bridge was torn down while I/O was pending.
    #[error("bridge closed")]
    BridgeClosed,
}

/// Buffer size of the in-memory pipe between bridge and handshake
/// library.
const BRIDGE_PIPE_CAPACITY: usize = 16 * 1024;

/// The bridge between the handshake library and the control channel.
pub struct TlsBridge;

impl TlsBridge {
    /// Wires up the bridge and returns the stream to hand to the
    /// handshake library.
    ///
    /// Outbound bytes written by the library are read in chunks of at
    /// most `max_chunk` and pushed into `payload_tx` (one chunk becomes
    /// one control payload). Inbound control payloads arriving on
    /// `payload_rx` are written back into the stream. The pump tasks end
    /// when the returned stream is dropped or the channels close.
    pub fn start(
        payload_tx: mpsc::Sender<Bytes>,
        mut payload_rx: mpsc::Receiver<Bytes>,
        max_chunk: usize,
    ) -> DuplexStream {
        let (library_side, bridge_side) = tokio::io::duplex(BRIDGE_PIPE_CAPACITY);
        let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

        // outbound: handshake library -> control channel
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_chunk];
            loop {
                match bridge_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        trace!("bridge: {} bytes out", n);
                        if payload_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("bridge: outbound pump done");
        });

        // inbound: control channel -> handshake library
        tokio::spawn(async move {
            while let Some(payload) = payload_rx.recv().await {
                trace!("bridge: {} bytes in", payload.len());
                if bridge_write.write_all(&payload).await.is_err() {
                    break;
                }
            }
            let _ = bridge_write.shutdown().await;
            debug!("bridge: inbound pump done");
        });

        library_side
    }
}

/// Builds the rustls client configuration from the engine config: root
/// CAs, optional client certificate, optional TLS version cap.
pub fn build_client_config(config: &Config) -> Result<rustls::ClientConfig, TlsError> {
    let ca_pem = Config::read_pem(&config.ca).map_err(|e| TlsError::BadConfig(e.to_string()))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|e| TlsError::BadConfig(format!("bad ca pem: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::BadConfig(format!("bad ca certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TlsError::BadConfig("no ca certificates found".to_string()));
    }

    let versions: &[&rustls::SupportedProtocolVersion] =
        match config.tls_max_version.as_deref() {
            Some("1.2") => &[&rustls::version::TLS12],
            _ => rustls::ALL_VERSIONS,
        };

    let builder = rustls::ClientConfig::builder_with_protocol_versions(versions)
        .with_root_certificates(roots);

    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let cert_pem =
                Config::read_pem(cert).map_err(|e| TlsError::BadConfig(e.to_string()))?;
            let key_pem = Config::read_pem(key).map_err(|e| TlsError::BadConfig(e.to_string()))?;

            let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<Result<_, _>>()
                .map_err(|e| TlsError::BadConfig(format!("bad cert pem: {e}")))?;
            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .map_err(|e| TlsError::BadConfig(format!("bad key pem: {e}")))?
                .ok_or_else(|| TlsError::BadConfig("no private key found".to_string()))?;

            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::BadConfig(e.to_string()))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Runs the TLS handshake over the bridge stream.
pub async fn handshake(
    tls_config: Arc<rustls::ClientConfig>,
    server_name: &str,
    stream: DuplexStream,
) -> Result<TlsStream<DuplexStream>, TlsError> {
    let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|e| TlsError::BadConfig(format!("invalid server name: {e}")))?;
    let connector = TlsConnector::from(tls_config);
    connector
        .connect(name, stream)
        .await
        .map_err(map_handshake_error)
}

/// Certificate problems surface as `BadCertChain`; anything else during
/// the handshake is `BadHandshake`.
fn map_handshake_error(err: io::Error) -> TlsError {
    if let Some(tls_err) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        if matches!(tls_err, rustls::Error::InvalidCertificate(_)) {
            return TlsError::BadCertChain(tls_err.to_string());
        }
        return TlsError::BadHandshake(tls_err.to_string());
    }
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return TlsError::BridgeClosed;
    }
    TlsError::BadHandshake(err.to_string())
}
