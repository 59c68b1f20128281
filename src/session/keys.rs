//! Key sources and the derived data-channel key block

use crate::crypto::{self, prf};
use crate::packet::SessionId;

use super::SessionError;

/// Length of the pre-master secret contributed by the client.
pub const PRE_MASTER_LEN: usize = 48;

/// Length of each random seed in a key source.
pub const RANDOM_LEN: usize = 32;

/// Size of one slot in the expanded key block.
pub const KEY_SLOT_LEN: usize = 64;

/// Total size of the expanded key block: four 64-byte slots.
pub const KEY_BLOCK_LEN: usize = 4 * KEY_SLOT_LEN;

/// One side's contribution to the key exchange: a pre-master secret
/// (client only) and two random seeds.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySource {
    pre_master: [u8; PRE_MASTER_LEN],
    random1: [u8; RANDOM_LEN],
    random2: [u8; RANDOM_LEN],
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material must not end up in logs
        f.write_str("KeySource{..}")
    }
}

impl KeySource {
    /// Generates a fresh key source from the CSPRNG.
    pub fn new() -> Self {
        let mut pre_master = [0u8; PRE_MASTER_LEN];
        let mut random1 = [0u8; RANDOM_LEN];
        let mut random2 = [0u8; RANDOM_LEN];
        crypto::random_bytes(&mut pre_master);
        crypto::random_bytes(&mut random1);
        crypto::random_bytes(&mut random2);
        KeySource { pre_master, random1, random2 }
    }

    /// Builds a key source from fixed bytes. Tests use this to pin the
    /// key schedule; the server's source has an all-zero pre-master.
    pub fn from_parts(
        pre_master: [u8; PRE_MASTER_LEN],
        random1: [u8; RANDOM_LEN],
        random2: [u8; RANDOM_LEN],
    ) -> Self {
        KeySource { pre_master, random1, random2 }
    }

    /// Parses the server's contribution (two seeds, no pre-master) from a
    /// key-method-2 message body.
    pub fn parse_remote(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() < 2 * RANDOM_LEN {
            return Err(SessionError::BadKeySource(bytes.len()));
        }
        let mut random1 = [0u8; RANDOM_LEN];
        let mut random2 = [0u8; RANDOM_LEN];
        random1.copy_from_slice(&bytes[..RANDOM_LEN]);
        random2.copy_from_slice(&bytes[RANDOM_LEN..2 * RANDOM_LEN]);
        Ok(KeySource { pre_master: [0u8; PRE_MASTER_LEN], random1, random2 })
    }

    /// Serializes the client contribution: pre-master, then both seeds.
    pub fn client_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PRE_MASTER_LEN + 2 * RANDOM_LEN);
        out.extend_from_slice(&self.pre_master);
        out.extend_from_slice(&self.random1);
        out.extend_from_slice(&self.random2);
        out
    }

    pub fn pre_master(&self) -> &[u8; PRE_MASTER_LEN] {
        &self.pre_master
    }

    pub fn random1(&self) -> &[u8; RANDOM_LEN] {
        &self.random1
    }

    pub fn random2(&self) -> &[u8; RANDOM_LEN] {
        &self.random2
    }
}

impl Default for KeySource {
    fn default() -> Self {
        Self::new()
    }
}

/// The key slot for one key epoch: the local contribution from engine
/// init plus the remote contribution once the exchange completes.
#[derive(Debug, Clone)]
pub struct DataChannelKey {
    local: KeySource,
    remote: Option<KeySource>,
}

impl DataChannelKey {
    pub fn new(local: KeySource) -> Self {
        DataChannelKey { local, remote: None }
    }

    pub fn local(&self) -> &KeySource {
        &self.local
    }

    pub fn remote(&self) -> Option<&KeySource> {
        self.remote.as_ref()
    }

    /// Stores the server's key source. Storing twice is rejected.
    pub fn add_remote(&mut self, remote: KeySource) -> Result<(), SessionError> {
        if self.remote.is_some() {
            return Err(SessionError::RemoteKeyAlreadySet);
        }
        self.remote = Some(remote);
        Ok(())
    }

    /// Both contributions are present and derivation may run.
    pub fn is_ready(&self) -> bool {
        self.remote.is_some()
    }
}

/// The expanded key block, partitioned into direction-specific slots.
/// From the client's point of view `encrypt_*` is client-to-server and
/// `decrypt_*` is server-to-client.
#[derive(Clone)]
pub struct KeyMaterial {
    pub encrypt_cipher: [u8; KEY_SLOT_LEN],
    pub encrypt_hmac: [u8; KEY_SLOT_LEN],
    pub decrypt_cipher: [u8; KEY_SLOT_LEN],
    pub decrypt_hmac: [u8; KEY_SLOT_LEN],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial{..}")
    }
}

/// Runs the two-stage PRF expansion over a completed key slot:
///
/// ```text
/// master = PRF(pre_master, "OpenVPN master secret",
///              client_random1, server_random1, 48)
/// block  = PRF(master, "OpenVPN key expansion",
///              client_random2, server_random2,
///              client_sid, server_sid, 256)
/// ```
pub fn derive_key_material(
    key: &DataChannelKey,
    client_sid: &SessionId,
    server_sid: &SessionId,
) -> Result<KeyMaterial, SessionError> {
    let remote = key.remote().ok_or(SessionError::KeyNotReady)?;
    let local = key.local();

    let master = prf(
        local.pre_master(),
        b"OpenVPN master secret",
        local.random1(),
        remote.random1(),
        &[],
        &[],
        PRE_MASTER_LEN,
    );
    let block = prf(
        &master,
        b"OpenVPN key expansion",
        local.random2(),
        remote.random2(),
        &client_sid.0,
        &server_sid.0,
        KEY_BLOCK_LEN,
    );

    let slot = |i: usize| -> [u8; KEY_SLOT_LEN] {
        let mut s = [0u8; KEY_SLOT_LEN];
        s.copy_from_slice(&block[i * KEY_SLOT_LEN..(i + 1) * KEY_SLOT_LEN]);
        s
    };

    Ok(KeyMaterial {
        encrypt_cipher: slot(0),
        encrypt_hmac: slot(1),
        decrypt_cipher: slot(2),
        decrypt_hmac: slot(3),
    })
}
