//! # rovpn
//!
//! A client-side protocol engine speaking the wire protocol of the
//! widely deployed open-source VPN daemon. It establishes an
//! authenticated, encrypted tunnel to a remote gateway and relays
//! network-layer payloads between the embedding application and the
//! peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Tunnel endpoint (bytes)               │
//! ├──────────────────────────┬──────────────────────────┤
//! │   Session & key schedule │       Data channel       │
//! │  (key method 2, TLS PRF) │  (AES-GCM / CBC+HMAC)    │
//! ├──────────────────────────┤                          │
//! │  Secure-transport bridge │                          │
//! ├──────────────────────────┤                          │
//! │    Reliable transport    │                          │
//! │  (ids, acks, retransmit) │                          │
//! ├──────────────────────────┴──────────────────────────┤
//! │                    Packet codec                      │
//! ├─────────────────────────────────────────────────────┤
//! │          Network I/O (datagram / stream)             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The control channel (left column) is reliable and in-order so the
//! embedded TLS handshake sees the transport it expects; the data
//! channel keeps datagram semantics. Both multiplex over one carrier.

pub mod config;
pub mod control;
pub mod crypto;
pub mod data;
pub mod network;
pub mod packet;
pub mod reliable;
pub mod session;
pub mod tls;
pub mod tunnel;

pub use config::{Config, Proto};
pub use tunnel::{ErrorKind, Event, Tunnel};

/// Crate version, advertised in the key-exchange peer info.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("packet error: {0}")]
    Packet(#[from] packet::PacketError),

    #[error("network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("reliable transport error: {0}")]
    Reliable(#[from] reliable::ReliableError),

    #[error("session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("control message error: {0}")]
    Control(#[from] control::ControlError),

    #[error("tls error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("data channel error: {0}")]
    Data(#[from] data::DataError),

    #[error("authentication failed")]
    AuthFailed,

    #[error("unexpected reset from peer")]
    UnexpectedReset,

    #[error("handshake deadline exceeded")]
    HandshakeTimeout,

    #[error("tunnel failed: {0:?}")]
    Fatal(ErrorKind),

    #[error("tunnel closed")]
    Closed,
}
