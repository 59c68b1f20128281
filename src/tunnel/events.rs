//! Observable engine events
//!
//! Events are broadcast over a subscription channel; sending never
//! blocks the protocol path, and subscribers that fall behind lose the
//! oldest events rather than stalling the engine.

use crate::control::ControlError;
use crate::crypto::CryptoError;
use crate::data::DataError;
use crate::network::NetworkError;
use crate::reliable::ReliableError;
use crate::session::SessionError;
use crate::tls::TlsError;
use crate::Error;

/// Lifecycle events observable by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Hard reset sent; session establishment underway.
    Reset,
    /// The embedded secure-transport handshake started.
    TlsHandshake,
    /// The embedded secure-transport handshake completed.
    TlsHandshakeDone,
    /// Keys exchanged and installed; tunnel parameters received.
    DataInitDone,
    /// The tunnel is fully usable.
    Ready,
    /// A fatal error tore the tunnel down.
    Error(ErrorKind),
}

/// Classification of fatal errors, mirroring the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadCertChain,
    BadHandshake,
    AuthFailed,
    PeerUnresponsive,
    UnexpectedReset,
    KeyDerivationFailed,
    CarrierClosed,
    KeyExpired,
    Replay,
    HandshakeTimeout,
    Internal,
}

impl From<&Error> for ErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::AuthFailed => ErrorKind::AuthFailed,
            Error::UnexpectedReset => ErrorKind::UnexpectedReset,
            Error::HandshakeTimeout => ErrorKind::HandshakeTimeout,
            Error::Tls(TlsError::BadCertChain(_)) => ErrorKind::BadCertChain,
            Error::Tls(_) => ErrorKind::BadHandshake,
            Error::Reliable(ReliableError::PeerUnresponsive(_)) => ErrorKind::PeerUnresponsive,
            Error::Reliable(ReliableError::Session(SessionError::KeyExpired)) => {
                ErrorKind::KeyExpired
            }
            Error::Session(SessionError::KeyExpired) => ErrorKind::KeyExpired,
            Error::Session(SessionError::KeyNotReady) => ErrorKind::KeyDerivationFailed,
            Error::Session(_) => ErrorKind::KeyDerivationFailed,
            Error::Data(DataError::Session(SessionError::KeyExpired)) => ErrorKind::KeyExpired,
            Error::Data(DataError::PersistentReplay(_)) => ErrorKind::Replay,
            Error::Data(DataError::Crypto(CryptoError::UnsupportedCipher(_))) => {
                ErrorKind::KeyDerivationFailed
            }
            Error::Data(_) => ErrorKind::Internal,
            Error::Network(NetworkError::CarrierClosed) => ErrorKind::CarrierClosed,
            Error::Network(_) => ErrorKind::CarrierClosed,
            Error::Control(ControlError::BadKeyMethod(_)) => ErrorKind::BadHandshake,
            Error::Control(_) => ErrorKind::BadHandshake,
            _ => ErrorKind::Internal,
        }
    }
}
