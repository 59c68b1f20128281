//! Session state shared across the engine's tasks
//!
//! The session manager is the only mutable object touched by more than
//! one task: it owns the session identifiers, both packet-id counters,
//! the negotiation state machine and the active key slot. Everything is
//! behind a single mutex with short critical sections.

mod keys;

pub use keys::{
    derive_key_material, DataChannelKey, KeyMaterial, KeySource, KEY_BLOCK_LEN, KEY_SLOT_LEN,
    PRE_MASTER_LEN, RANDOM_LEN,
};

use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;
use tracing::info;

use crate::crypto;
use crate::packet::{Opcode, Packet, PacketId, PeerId, SessionId};

/// Session errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A packet-id counter reached its maximum; the key epoch is over.
    #[error("key expired: packet id space exhausted")]
    KeyExpired,

    #[error("missing remote session id")]
    NoRemoteSessionId,

    #[error("bad key source length: {0}")]
    BadKeySource(usize),

    #[error("remote key source already set")]
    RemoteKeyAlreadySet,

    #[error("key slot not ready for derivation")]
    KeyNotReady,
}

/// Handshake progress. Transitions are strictly monotone; regressing is
/// a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Initial,
    /// Hard reset sent.
    PreStart,
    /// Hard reset reply received, session ids established.
    Start,
    /// Our key-method-2 message is out.
    SentKey,
    /// The server's key-method-2 message arrived.
    GotKey,
    /// Key material derived.
    Active,
    /// Keys installed in the data channel; encryption may begin.
    GeneratedKeys,
    /// Terminal failure state.
    Error,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NegotiationState::Initial => "INITIAL",
            NegotiationState::PreStart => "PRE_START",
            NegotiationState::Start => "START",
            NegotiationState::SentKey => "SENT_KEY",
            NegotiationState::GotKey => "GOT_KEY",
            NegotiationState::Active => "ACTIVE",
            NegotiationState::GeneratedKeys => "GENERATED_KEYS",
            NegotiationState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Network-layer parameters pushed by the server after authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelInfo {
    pub mtu: u16,
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub peer_id: Option<PeerId>,
}

struct Inner {
    key_id: u8,
    local_session_id: SessionId,
    remote_session_id: Option<SessionId>,
    // next ids to hand out; both start at 1 because the hard reset owns
    // control id 0 and the reference server misbehaves when the data
    // counter starts at 0
    control_packet_id: PacketId,
    data_packet_id: PacketId,
    state: NegotiationState,
    key: DataChannelKey,
    tunnel: TunnelInfo,
}

/// Concurrency-safe session manager. Construct with [`SessionManager::new`].
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    /// Creates a session with a random local session id and a fresh local
    /// key source.
    pub fn new() -> Self {
        let mut sid = [0u8; 8];
        crypto::random_bytes(&mut sid);
        Self::with_parts(SessionId(sid), KeySource::new())
    }

    /// Deterministic constructor for tests.
    pub fn with_parts(local_session_id: SessionId, local_key: KeySource) -> Self {
        SessionManager {
            inner: Mutex::new(Inner {
                key_id: 0,
                local_session_id,
                remote_session_id: None,
                control_packet_id: 1,
                data_packet_id: 1,
                state: NegotiationState::Initial,
                key: DataChannelKey::new(local_key),
                tunnel: TunnelInfo::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned session mutex means a task panicked mid-update;
        // there is no meaningful recovery
        self.inner.lock().expect("session mutex poisoned")
    }

    pub fn local_session_id(&self) -> SessionId {
        self.lock().local_session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.lock().remote_session_id
    }

    /// Records the remote session id learned from the hard-reset reply.
    /// Calling this twice is a bug in the caller.
    pub fn set_remote_session_id(&self, sid: SessionId) {
        let mut inner = self.lock();
        assert!(
            inner.remote_session_id.is_none(),
            "remote session id set more than once"
        );
        inner.remote_session_id = Some(sid);
    }

    pub fn key_id(&self) -> u8 {
        self.lock().key_id
    }

    /// Hands out the next control-channel packet id.
    pub fn next_control_id(&self) -> Result<PacketId, SessionError> {
        let mut inner = self.lock();
        let id = inner.control_packet_id;
        if id == PacketId::MAX {
            return Err(SessionError::KeyExpired);
        }
        inner.control_packet_id += 1;
        Ok(id)
    }

    /// Hands out the next data-channel packet id.
    pub fn next_data_id(&self) -> Result<PacketId, SessionError> {
        let mut inner = self.lock();
        let id = inner.data_packet_id;
        if id == PacketId::MAX {
            return Err(SessionError::KeyExpired);
        }
        inner.data_packet_id += 1;
        Ok(id)
    }

    pub fn state(&self) -> NegotiationState {
        self.lock().state
    }

    /// Advances the negotiation state. `Error` is always reachable; any
    /// other backwards transition is a programmer error.
    pub fn set_state(&self, next: NegotiationState) {
        let mut inner = self.lock();
        if next != NegotiationState::Error {
            assert!(
                next >= inner.state,
                "negotiation state regression: {} -> {}",
                inner.state,
                next
            );
        }
        if next != inner.state {
            info!("negotiation: {} -> {}", inner.state, next);
        }
        inner.state = next;
    }

    /// Builds the opening hard-reset packet. Its id is always 0 and does
    /// not consume the control counter.
    pub fn new_hard_reset_packet(&self) -> Packet {
        let inner = self.lock();
        let mut p = Packet::control(Opcode::ControlHardResetClientV2, inner.key_id, Bytes::new());
        p.local_session_id = inner.local_session_id;
        p.id = 0;
        p
    }

    /// Builds a `CONTROL_V1` packet with the next control id. Acks are
    /// attached later by the reliable transport.
    pub fn new_control_packet(&self, payload: Bytes) -> Result<Packet, SessionError> {
        let id = self.next_control_id()?;
        let inner = self.lock();
        let mut p = Packet::control(Opcode::ControlV1, inner.key_id, payload);
        p.local_session_id = inner.local_session_id;
        if let Some(remote) = inner.remote_session_id {
            p.remote_session_id = remote;
        }
        p.id = id;
        Ok(p)
    }

    /// Builds a standalone `ACK_V1` for the given packet ids. Requires the
    /// remote session id to be known.
    pub fn new_ack_packet(&self, ids: Vec<PacketId>) -> Result<Packet, SessionError> {
        let inner = self.lock();
        let remote = inner.remote_session_id.ok_or(SessionError::NoRemoteSessionId)?;
        let mut p = Packet::control(Opcode::AckV1, inner.key_id, Bytes::new());
        p.local_session_id = inner.local_session_id;
        p.remote_session_id = remote;
        p.acks = ids;
        Ok(p)
    }

    /// Copy of the local key source for the key-method-2 message.
    pub fn local_key_source(&self) -> KeySource {
        self.lock().key.local().clone()
    }

    /// Stores the server's key source in the active slot.
    pub fn add_remote_key_source(&self, remote: KeySource) -> Result<(), SessionError> {
        self.lock().key.add_remote(remote)
    }

    /// Derives the data-channel key block once both contributions exist.
    pub fn derive_key_material(&self) -> Result<KeyMaterial, SessionError> {
        let inner = self.lock();
        let server_sid = inner.remote_session_id.ok_or(SessionError::NoRemoteSessionId)?;
        derive_key_material(&inner.key, &inner.local_session_id, &server_sid)
    }

    #[cfg(test)]
    pub(crate) fn force_data_packet_id(&self, id: PacketId) {
        self.lock().data_packet_id = id;
    }

    pub fn tunnel_info(&self) -> TunnelInfo {
        self.lock().tunnel.clone()
    }

    /// Stores the MTU announced in the server's remote-options string.
    pub fn set_tunnel_mtu(&self, mtu: u16) {
        let mut inner = self.lock();
        inner.tunnel.mtu = mtu;
        info!("tunnel mtu: {}", mtu);
    }

    /// Merges the parameters pushed by the server after authentication.
    pub fn update_tunnel_info(&self, ti: &TunnelInfo) {
        let mut inner = self.lock();
        inner.tunnel.ip = ti.ip.clone();
        inner.tunnel.netmask = ti.netmask.clone();
        inner.tunnel.gateway = ti.gateway.clone();
        inner.tunnel.peer_id = ti.peer_id;
        if ti.mtu != 0 {
            inner.tunnel.mtu = ti.mtu;
        }
        info!(
            "tunnel ip: {} gw: {} peer-id: {:?}",
            inner.tunnel.ip, inner.tunnel.gateway, inner.tunnel.peer_id
        );
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
