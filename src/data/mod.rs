//! Data channel
//!
//! Encrypts outbound tunnel payloads and decrypts inbound ones with the
//! negotiated bulk cipher, enforces replay protection, and recognizes the
//! peer's keepalive probes. Key material arrives once, derived by the key
//! schedule after the control-channel exchange; after installation this
//! module owns it exclusively.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{
    self, pkcs7_pad, pkcs7_unpad, AuthDigest, CipherMode, CryptoError, DataCipher, AEAD_TAG_LEN,
    CBC_BLOCK_SIZE, GCM_NONCE_LEN,
};
use crate::packet::{Opcode, Packet, PacketId, PeerId};
use crate::session::{KeyMaterial, SessionError, SessionManager};

/// The reference daemon's keepalive probe, reproduced from a captured
/// decrypted trace. Echoed back encrypted, never delivered to the tun.
pub const PING_PAYLOAD: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

/// How many back-to-back replay rejections count as a persistent attack
/// rather than stray duplication.
const PERSISTENT_REPLAY_THRESHOLD: u32 = 64;

/// Data channel errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("data payload too short: {0} bytes")]
    ShortPayload(usize),

    #[error("replayed packet id {0}")]
    Replay(PacketId),

    #[error("persistent replay: {0} consecutive rejections")]
    PersistentReplay(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A decrypted inbound data packet.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundData {
    /// Plaintext to hand to the tun collaborator.
    Plain(Vec<u8>),
    /// The peer's keepalive probe; reply with the same payload encrypted.
    Keepalive,
}

/// Sliding-window replay filter over inbound packet ids.
#[derive(Debug, Default)]
struct ReplayWindow {
    top: PacketId,
    bitmap: u64,
}

impl ReplayWindow {
    const SIZE: u32 = 64;

    /// Accepts and records `id`, or rejects it as a duplicate / too old.
    fn check_and_update(&mut self, id: PacketId) -> bool {
        if id == 0 {
            return false;
        }
        if id > self.top {
            let shift = id - self.top;
            self.bitmap = if shift >= Self::SIZE { 1 } else { (self.bitmap << shift) | 1 };
            self.top = id;
            return true;
        }
        let offset = self.top - id;
        if offset >= Self::SIZE {
            return false;
        }
        let bit = 1u64 << offset;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// The installed key set plus the negotiated cipher and digest.
pub struct DataChannelKeys {
    cipher: DataCipher,
    digest: AuthDigest,
    material: KeyMaterial,
}

impl DataChannelKeys {
    pub fn new(cipher: DataCipher, digest: AuthDigest, material: KeyMaterial) -> Self {
        DataChannelKeys { cipher, digest, material }
    }

    fn hmac_key_len(&self) -> usize {
        self.digest.output_len()
    }

    /// Encrypts one payload into the wire form for `packet_id`.
    pub fn encrypt(
        &self,
        packet_id: PacketId,
        plaintext: &[u8],
        peer_id: Option<PeerId>,
    ) -> Result<Vec<u8>, DataError> {
        let pid = packet_id.to_be_bytes();
        match self.cipher.mode() {
            CipherMode::Gcm => {
                // nonce: packet id then implicit salt from the hmac slot
                let mut nonce = [0u8; GCM_NONCE_LEN];
                nonce[..4].copy_from_slice(&pid);
                nonce[4..].copy_from_slice(&self.material.encrypt_hmac[..8]);

                let mut ad = pid.to_vec();
                if let Some(peer) = peer_id {
                    ad.extend_from_slice(&peer.0);
                }

                let sealed =
                    self.cipher.encrypt(&self.material.encrypt_cipher, &nonce, plaintext, &ad)?;
                let (ct, tag) = sealed.split_at(sealed.len() - AEAD_TAG_LEN);

                let mut wire = Vec::with_capacity(4 + AEAD_TAG_LEN + ct.len());
                wire.extend_from_slice(&pid);
                wire.extend_from_slice(tag);
                wire.extend_from_slice(ct);
                Ok(wire)
            }
            CipherMode::Cbc => {
                let mut iv = [0u8; CBC_BLOCK_SIZE];
                crypto::random_bytes(&mut iv);

                // the packet id rides at the head of the plaintext
                let mut pt = Vec::with_capacity(4 + plaintext.len());
                pt.extend_from_slice(&pid);
                pt.extend_from_slice(plaintext);
                let padded = pkcs7_pad(&pt, CBC_BLOCK_SIZE)?;

                let ct = self.cipher.encrypt(&self.material.encrypt_cipher, &iv, &padded, &[])?;
                let mac = self.digest.hmac(
                    &self.material.encrypt_hmac[..self.hmac_key_len()],
                    &[&iv, &ct],
                );

                let mut wire = Vec::with_capacity(mac.len() + iv.len() + ct.len());
                wire.extend_from_slice(&mac);
                wire.extend_from_slice(&iv);
                wire.extend_from_slice(&ct);
                Ok(wire)
            }
        }
    }

    /// Decrypts one inbound data packet payload, returning the packet id
    /// it carried and the plaintext.
    pub fn decrypt(&self, packet: &Packet) -> Result<(PacketId, Vec<u8>), DataError> {
        let payload = &packet.payload;
        match self.cipher.mode() {
            CipherMode::Gcm => {
                if payload.len() < 4 + AEAD_TAG_LEN {
                    return Err(DataError::ShortPayload(payload.len()));
                }
                let pid = &payload[..4];
                let tag = &payload[4..4 + AEAD_TAG_LEN];
                let ct = &payload[4 + AEAD_TAG_LEN..];

                let mut nonce = [0u8; GCM_NONCE_LEN];
                nonce[..4].copy_from_slice(pid);
                nonce[4..].copy_from_slice(&self.material.decrypt_hmac[..8]);

                let mut ad = pid.to_vec();
                if packet.opcode == Opcode::DataV2 {
                    ad.extend_from_slice(&packet.peer_id.0);
                }

                // the cipher expects the tag appended
                let mut sealed = Vec::with_capacity(ct.len() + AEAD_TAG_LEN);
                sealed.extend_from_slice(ct);
                sealed.extend_from_slice(tag);

                let plain =
                    self.cipher.decrypt(&self.material.decrypt_cipher, &nonce, &sealed, &ad)?;
                let id = PacketId::from_be_bytes([pid[0], pid[1], pid[2], pid[3]]);
                Ok((id, plain))
            }
            CipherMode::Cbc => {
                let mac_len = self.digest.output_len();
                if payload.len() < mac_len + CBC_BLOCK_SIZE + CBC_BLOCK_SIZE {
                    return Err(DataError::ShortPayload(payload.len()));
                }
                let mac = &payload[..mac_len];
                let iv = &payload[mac_len..mac_len + CBC_BLOCK_SIZE];
                let ct = &payload[mac_len + CBC_BLOCK_SIZE..];

                self.digest.verify(
                    &self.material.decrypt_hmac[..self.hmac_key_len()],
                    &[iv, ct],
                    mac,
                )?;

                let padded = self.cipher.decrypt(&self.material.decrypt_cipher, iv, ct, &[])?;
                let plain = pkcs7_unpad(&padded, CBC_BLOCK_SIZE)?;
                if plain.len() < 4 {
                    return Err(DataError::ShortPayload(plain.len()));
                }
                let id = PacketId::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
                Ok((id, plain[4..].to_vec()))
            }
        }
    }
}

/// The data-channel state driven by the engine's workers.
pub struct DataChannel {
    session: Arc<SessionManager>,
    keys: DataChannelKeys,
    replay: ReplayWindow,
    consecutive_replays: u32,
}

impl DataChannel {
    /// Installs derived key material for the negotiated suite.
    pub fn new(
        session: Arc<SessionManager>,
        cipher: DataCipher,
        digest: AuthDigest,
        material: KeyMaterial,
    ) -> Self {
        DataChannel {
            session,
            keys: DataChannelKeys::new(cipher, digest, material),
            replay: ReplayWindow::default(),
            consecutive_replays: 0,
        }
    }

    /// Encrypts one outbound payload into a ready-to-serialize packet.
    /// Uses `DATA_V2` framing once the server has pushed a peer id.
    pub fn encrypt_packet(&self, plaintext: &[u8]) -> Result<Packet, DataError> {
        let id = self.session.next_data_id()?;
        let peer_id = self.session.tunnel_info().peer_id;
        let payload = self.keys.encrypt(id, plaintext, peer_id)?;
        Ok(Packet::data(self.session.key_id(), peer_id, Bytes::from(payload)))
    }

    /// Decrypts one inbound data packet, enforcing the replay window and
    /// recognizing keepalives.
    pub fn decrypt_packet(&mut self, packet: &Packet) -> Result<InboundData, DataError> {
        let (id, plain) = self.keys.decrypt(packet)?;

        if !self.replay.check_and_update(id) {
            self.consecutive_replays += 1;
            if self.consecutive_replays >= PERSISTENT_REPLAY_THRESHOLD {
                warn!("replay window: {} consecutive rejections", self.consecutive_replays);
                return Err(DataError::PersistentReplay(self.consecutive_replays));
            }
            return Err(DataError::Replay(id));
        }
        self.consecutive_replays = 0;

        if plain == PING_PAYLOAD {
            debug!("keepalive probe from peer");
            return Ok(InboundData::Keepalive);
        }
        Ok(InboundData::Plain(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SessionId;
    use crate::session::{KeySource, KEY_SLOT_LEN, PRE_MASTER_LEN, RANDOM_LEN};

    fn client_material() -> KeyMaterial {
        KeyMaterial {
            encrypt_cipher: [0x11; KEY_SLOT_LEN],
            encrypt_hmac: [0x22; KEY_SLOT_LEN],
            decrypt_cipher: [0x33; KEY_SLOT_LEN],
            decrypt_hmac: [0x44; KEY_SLOT_LEN],
        }
    }

    /// The peer's view: our decrypt keys are its encrypt keys.
    fn server_material() -> KeyMaterial {
        KeyMaterial {
            encrypt_cipher: [0x33; KEY_SLOT_LEN],
            encrypt_hmac: [0x44; KEY_SLOT_LEN],
            decrypt_cipher: [0x11; KEY_SLOT_LEN],
            decrypt_hmac: [0x22; KEY_SLOT_LEN],
        }
    }

    fn keys(suite: &str, material: KeyMaterial) -> DataChannelKeys {
        DataChannelKeys::new(
            DataCipher::from_suite(suite).unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            material,
        )
    }

    fn test_session() -> Arc<SessionManager> {
        Arc::new(SessionManager::with_parts(
            SessionId([0xaa; 8]),
            KeySource::from_parts([1; PRE_MASTER_LEN], [2; RANDOM_LEN], [3; RANDOM_LEN]),
        ))
    }

    fn inbound_packet(keys: &DataChannelKeys, id: PacketId, plaintext: &[u8]) -> Packet {
        let payload = keys.encrypt(id, plaintext, None).unwrap();
        Packet::data(0, None, Bytes::from(payload))
    }

    #[test]
    fn test_gcm_encrypt_decrypt_roundtrip() {
        for suite in ["AES-128-GCM", "AES-192-GCM", "AES-256-GCM"] {
            let client = keys(suite, client_material());
            let server = keys(suite, server_material());

            let wire = client.encrypt(7, b"ip packet", None).unwrap();
            // wire layout: packet id, tag, ciphertext
            assert_eq!(&wire[..4], &7u32.to_be_bytes());
            assert_eq!(wire.len(), 4 + AEAD_TAG_LEN + b"ip packet".len());

            let packet = Packet::data(0, None, Bytes::from(wire));
            let (id, plain) = server.decrypt(&packet).unwrap();
            assert_eq!(id, 7);
            assert_eq!(plain, b"ip packet");
        }
    }

    #[test]
    fn test_gcm_peer_id_bound_into_ad() {
        let client = keys("AES-128-GCM", client_material());
        let server = keys("AES-128-GCM", server_material());
        let peer = PeerId([0x00, 0x00, 0x07]);

        let wire = client.encrypt(3, b"v2 data", Some(peer)).unwrap();
        let good = Packet {
            peer_id: peer,
            ..Packet::data(0, Some(peer), Bytes::from(wire.clone()))
        };
        assert_eq!(server.decrypt(&good).unwrap().1, b"v2 data");

        // same bytes under a different peer id must fail authentication
        let bad = Packet {
            peer_id: PeerId([0x00, 0x00, 0x08]),
            ..Packet::data(0, Some(peer), Bytes::from(wire))
        };
        assert_eq!(server.decrypt(&bad), Err(DataError::Crypto(CryptoError::Open)));
    }

    #[test]
    fn test_cbc_encrypt_decrypt_roundtrip() {
        for suite in ["AES-128-CBC", "AES-256-CBC"] {
            let client = keys(suite, client_material());
            let server = keys(suite, server_material());

            let wire = client.encrypt(9, b"cbc payload bytes", None).unwrap();
            // wire layout: hmac-sha1 (20), iv (16), ciphertext.
            // plaintext is 4 (packet id) + 17 bytes, padded to 32.
            assert_eq!(wire.len(), 20 + 16 + 32);

            let packet = Packet::data(0, None, Bytes::from(wire));
            let (id, plain) = server.decrypt(&packet).unwrap();
            assert_eq!(id, 9);
            assert_eq!(plain, b"cbc payload bytes");
        }
    }

    #[test]
    fn test_cbc_rejects_tampered_mac_and_body() {
        let client = keys("AES-128-CBC", client_material());
        let server = keys("AES-128-CBC", server_material());

        let wire = client.encrypt(1, b"payload", None).unwrap();

        let mut bad_mac = wire.clone();
        bad_mac[0] ^= 0xff;
        let packet = Packet::data(0, None, Bytes::from(bad_mac));
        assert_eq!(server.decrypt(&packet), Err(DataError::Crypto(CryptoError::BadMac)));

        let mut bad_body = wire;
        let last = bad_body.len() - 1;
        bad_body[last] ^= 0xff;
        let packet = Packet::data(0, None, Bytes::from(bad_body));
        assert_eq!(server.decrypt(&packet), Err(DataError::Crypto(CryptoError::BadMac)));
    }

    #[test]
    fn test_replay_window_semantics() {
        let mut w = ReplayWindow::default();
        assert!(!w.check_and_update(0)); // id 0 never valid
        assert!(w.check_and_update(1));
        assert!(w.check_and_update(2));
        assert!(!w.check_and_update(2)); // duplicate
        assert!(w.check_and_update(5));
        assert!(w.check_and_update(4)); // out of order, within window
        assert!(!w.check_and_update(4));

        assert!(w.check_and_update(100));
        assert!(!w.check_and_update(36)); // 64 below the top: too old
        assert!(w.check_and_update(37)); // just inside
    }

    #[test]
    fn test_duplicate_data_packet_rejected() {
        let server = keys("AES-128-GCM", server_material());
        let mut dc = DataChannel::new(
            test_session(),
            DataCipher::from_suite("AES-128-GCM").unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            client_material(),
        );

        let packet = inbound_packet(&server, 1, b"once");
        assert_eq!(dc.decrypt_packet(&packet).unwrap(), InboundData::Plain(b"once".to_vec()));
        assert_eq!(dc.decrypt_packet(&packet), Err(DataError::Replay(1)));
    }

    #[test]
    fn test_persistent_replay_escalates() {
        let server = keys("AES-128-GCM", server_material());
        let mut dc = DataChannel::new(
            test_session(),
            DataCipher::from_suite("AES-128-GCM").unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            client_material(),
        );

        let packet = inbound_packet(&server, 1, b"once");
        dc.decrypt_packet(&packet).unwrap();
        for _ in 0..PERSISTENT_REPLAY_THRESHOLD - 1 {
            assert_eq!(dc.decrypt_packet(&packet), Err(DataError::Replay(1)));
        }
        assert_eq!(
            dc.decrypt_packet(&packet),
            Err(DataError::PersistentReplay(PERSISTENT_REPLAY_THRESHOLD))
        );
    }

    #[test]
    fn test_keepalive_recognized_not_delivered() {
        let server = keys("AES-128-GCM", server_material());
        let mut dc = DataChannel::new(
            test_session(),
            DataCipher::from_suite("AES-128-GCM").unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            client_material(),
        );

        let packet = inbound_packet(&server, 1, &PING_PAYLOAD);
        assert_eq!(dc.decrypt_packet(&packet).unwrap(), InboundData::Keepalive);
    }

    #[test]
    fn test_encrypt_packet_ids_increase_and_expire() {
        let session = test_session();
        let dc = DataChannel::new(
            Arc::clone(&session),
            DataCipher::from_suite("AES-128-GCM").unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            client_material(),
        );

        let p1 = dc.encrypt_packet(b"a").unwrap();
        let p2 = dc.encrypt_packet(b"b").unwrap();
        assert_eq!(p1.opcode, Opcode::DataV1); // no peer id pushed yet
        assert_eq!(&p1.payload[..4], &1u32.to_be_bytes());
        assert_eq!(&p2.payload[..4], &2u32.to_be_bytes());
    }

    #[test]
    fn test_encrypt_uses_data_v2_once_peer_id_known() {
        let session = test_session();
        session.update_tunnel_info(&crate::session::TunnelInfo {
            mtu: 0,
            ip: String::new(),
            netmask: String::new(),
            gateway: String::new(),
            peer_id: Some(PeerId([0, 0, 9])),
        });
        let dc = DataChannel::new(
            Arc::clone(&session),
            DataCipher::from_suite("AES-128-GCM").unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            client_material(),
        );
        let p = dc.encrypt_packet(b"a").unwrap();
        assert_eq!(p.opcode, Opcode::DataV2);
        assert_eq!(p.peer_id, PeerId([0, 0, 9]));
    }

    #[test]
    fn test_packet_id_exhaustion_is_key_expired() {
        let session = test_session();
        session.force_data_packet_id(PacketId::MAX);
        let dc = DataChannel::new(
            session,
            DataCipher::from_suite("AES-128-GCM").unwrap(),
            AuthDigest::from_name("sha1").unwrap(),
            client_material(),
        );
        assert_eq!(
            dc.encrypt_packet(b"x"),
            Err(DataError::Session(SessionError::KeyExpired))
        );
    }
}
