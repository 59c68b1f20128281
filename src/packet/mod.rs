//! Wire packet codec
//!
//! Serialization and parsing of the packet header shared by the control
//! and data channels. The codec is pure: no state, no side effects.
//!
//! Control packet layout:
//! ```text
//! +----------------+--------------------------+
//! | opcode+key_id  |  opcode in high 5 bits   |
//! +----------------+--------------------------+
//! | local session id (8B)                     |
//! +-------------------------------------------+
//! | ack count (1B) | acks (4B each, BE)       |
//! +-------------------------------------------+
//! | remote session id (8B, iff ack count > 0) |
//! +-------------------------------------------+
//! | packet id (4B, BE; absent for ACK_V1)     |
//! +-------------------------------------------+
//! | payload                                   |
//! +-------------------------------------------+
//! ```
//!
//! Data packets carry only the opcode byte (plus a 3-byte peer id for
//! `DATA_V2`) followed by the encrypted payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Length of a session identifier in bytes.
pub const SESSION_ID_LEN: usize = 8;

/// Length of a serialized packet id in bytes.
pub const PACKET_ID_LEN: usize = 4;

/// A full hard-reset reply from the server: opcode + local session id +
/// one ack + remote session id + packet id.
pub const HARD_RESET_SERVER_LEN: usize = 1 + SESSION_ID_LEN + 1 + PACKET_ID_LEN + SESSION_ID_LEN + PACKET_ID_LEN;

/// Packet codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("ack array length {0} exceeds remaining bytes")]
    BadAckArray(u8),

    #[error("unexpected trailing bytes after {0:?} packet")]
    TrailingBytes(Opcode),
}

/// Monotonically increasing per-direction packet identifier.
pub type PacketId = u32;

/// An 8-byte session identifier, chosen at random for each direction.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; SESSION_ID_LEN]);

impl SessionId {
    /// Returns true if this id is all zeroes (i.e. never assigned).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; SESSION_ID_LEN]
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl From<[u8; SESSION_ID_LEN]> for SessionId {
    fn from(b: [u8; SESSION_ID_LEN]) -> Self {
        SessionId(b)
    }
}

/// The 3-byte peer tag the server assigns after authentication.
/// Prefixed on every `DATA_V2` packet.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PeerId(pub [u8; 3]);

impl PeerId {
    /// Builds a peer id from the numeric form found in pushed options.
    pub fn from_u32(v: u32) -> Self {
        let b = v.to_be_bytes();
        PeerId([b[1], b[2], b[3]])
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }
}

/// Packet classes (5-bit opcode in the high bits of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Payload-bearing control packet carrying secure-transport records.
    ControlV1 = 0x04,
    /// Pure acknowledgment; no payload, no packet id of its own.
    AckV1 = 0x05,
    /// Bulk data, no peer-id prefix.
    DataV1 = 0x06,
    /// Initial client hello.
    ControlHardResetClientV2 = 0x07,
    /// Server reply to the client hello.
    ControlHardResetServerV2 = 0x08,
    /// Bulk data with a 3-byte peer-id prefix.
    DataV2 = 0x09,
}

impl TryFrom<u8> for Opcode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x04 => Ok(Opcode::ControlV1),
            0x05 => Ok(Opcode::AckV1),
            0x06 => Ok(Opcode::DataV1),
            0x07 => Ok(Opcode::ControlHardResetClientV2),
            0x08 => Ok(Opcode::ControlHardResetServerV2),
            0x09 => Ok(Opcode::DataV2),
            _ => Err(PacketError::UnknownOpcode(value)),
        }
    }
}

impl Opcode {
    /// Control-class packets: carry session ids, acks and a packet id.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::ControlV1 | Opcode::ControlHardResetClientV2 | Opcode::ControlHardResetServerV2
        )
    }

    pub fn is_ack(self) -> bool {
        self == Opcode::AckV1
    }

    pub fn is_data(self) -> bool {
        matches!(self, Opcode::DataV1 | Opcode::DataV2)
    }
}

/// A parsed wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    /// Key epoch, low 3 bits of the first byte.
    pub key_id: u8,
    /// Only serialized for `DATA_V2`.
    pub peer_id: PeerId,
    pub local_session_id: SessionId,
    /// Packet ids being acknowledged to the peer.
    pub acks: Vec<PacketId>,
    /// Present on the wire iff `acks` is non-empty.
    pub remote_session_id: SessionId,
    /// Not serialized for `ACK_V1` or data packets.
    pub id: PacketId,
    pub payload: Bytes,
}

impl Packet {
    /// Creates a control-class packet with no acks attached yet.
    pub fn control(opcode: Opcode, key_id: u8, payload: Bytes) -> Self {
        Packet {
            opcode,
            key_id,
            peer_id: PeerId::default(),
            local_session_id: SessionId::default(),
            acks: Vec::new(),
            remote_session_id: SessionId::default(),
            id: 0,
            payload,
        }
    }

    /// Creates a data packet. `peer_id` selects `DATA_V2` framing.
    pub fn data(key_id: u8, peer_id: Option<PeerId>, payload: Bytes) -> Self {
        Packet {
            opcode: if peer_id.is_some() { Opcode::DataV2 } else { Opcode::DataV1 },
            key_id,
            peer_id: peer_id.unwrap_or_default(),
            local_session_id: SessionId::default(),
            acks: Vec::new(),
            remote_session_id: SessionId::default(),
            id: 0,
            payload,
        }
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    pub fn is_ack(&self) -> bool {
        self.opcode.is_ack()
    }

    pub fn is_data(&self) -> bool {
        self.opcode.is_data()
    }

    /// Serializes the packet. Total for well-formed inputs.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            1 + SESSION_ID_LEN * 2 + 1 + self.acks.len() * PACKET_ID_LEN + PACKET_ID_LEN + self.payload.len(),
        );
        buf.put_u8(((self.opcode as u8) << 3) | (self.key_id & 0x07));

        match self.opcode {
            Opcode::DataV1 => {
                buf.extend_from_slice(&self.payload);
            }
            Opcode::DataV2 => {
                buf.extend_from_slice(&self.peer_id.0);
                buf.extend_from_slice(&self.payload);
            }
            _ => {
                buf.extend_from_slice(&self.local_session_id.0);
                buf.put_u8(self.acks.len() as u8);
                for ack in &self.acks {
                    buf.put_u32(*ack);
                }
                if !self.acks.is_empty() {
                    buf.extend_from_slice(&self.remote_session_id.0);
                }
                if self.opcode != Opcode::AckV1 {
                    buf.put_u32(self.id);
                }
                buf.extend_from_slice(&self.payload);
            }
        }
        buf.freeze()
    }

    /// Parses one wire packet.
    pub fn parse(input: &[u8]) -> Result<Packet, PacketError> {
        if input.is_empty() {
            return Err(PacketError::TooShort(0));
        }
        let opcode = Opcode::try_from(input[0] >> 3)?;
        let key_id = input[0] & 0x07;
        let mut buf = Bytes::copy_from_slice(&input[1..]);

        match opcode {
            Opcode::DataV1 => Ok(Packet {
                opcode,
                key_id,
                peer_id: PeerId::default(),
                local_session_id: SessionId::default(),
                acks: Vec::new(),
                remote_session_id: SessionId::default(),
                id: 0,
                payload: buf,
            }),
            Opcode::DataV2 => {
                if buf.len() < 3 {
                    return Err(PacketError::TooShort(input.len()));
                }
                let mut peer = [0u8; 3];
                buf.copy_to_slice(&mut peer);
                Ok(Packet {
                    opcode,
                    key_id,
                    peer_id: PeerId(peer),
                    local_session_id: SessionId::default(),
                    acks: Vec::new(),
                    remote_session_id: SessionId::default(),
                    id: 0,
                    payload: buf,
                })
            }
            _ => Self::parse_control(opcode, key_id, buf, input.len()),
        }
    }

    fn parse_control(
        opcode: Opcode,
        key_id: u8,
        mut buf: Bytes,
        wire_len: usize,
    ) -> Result<Packet, PacketError> {
        if buf.len() < SESSION_ID_LEN + 1 {
            return Err(PacketError::TooShort(wire_len));
        }
        let mut local = [0u8; SESSION_ID_LEN];
        buf.copy_to_slice(&mut local);

        let ack_len = buf.get_u8();
        if buf.len() < ack_len as usize * PACKET_ID_LEN {
            return Err(PacketError::BadAckArray(ack_len));
        }
        let mut acks = Vec::with_capacity(ack_len as usize);
        for _ in 0..ack_len {
            acks.push(buf.get_u32());
        }

        let mut remote = [0u8; SESSION_ID_LEN];
        if ack_len > 0 {
            if buf.len() < SESSION_ID_LEN {
                return Err(PacketError::TooShort(wire_len));
            }
            buf.copy_to_slice(&mut remote);
        }

        let id = if opcode == Opcode::AckV1 {
            0
        } else {
            if buf.len() < PACKET_ID_LEN {
                return Err(PacketError::TooShort(wire_len));
            }
            buf.get_u32()
        };

        if opcode == Opcode::AckV1 && !buf.is_empty() {
            return Err(PacketError::TrailingBytes(opcode));
        }

        Ok(Packet {
            opcode,
            key_id,
            peer_id: PeerId::default(),
            local_session_id: SessionId(local),
            acks,
            remote_session_id: SessionId(remote),
            id,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(b: u8) -> SessionId {
        SessionId([b; 8])
    }

    #[test]
    fn test_control_roundtrip() {
        let mut p = Packet::control(Opcode::ControlV1, 0, Bytes::from_static(b"tls record"));
        p.local_session_id = sid(0xaa);
        p.remote_session_id = sid(0xbb);
        p.acks = vec![1, 2];
        p.id = 7;

        let parsed = Packet::parse(&p.serialize()).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn test_roundtrip_all_opcodes() {
        for opcode in [
            Opcode::ControlV1,
            Opcode::AckV1,
            Opcode::DataV1,
            Opcode::ControlHardResetClientV2,
            Opcode::ControlHardResetServerV2,
            Opcode::DataV2,
        ] {
            let mut p = Packet {
                opcode,
                key_id: 2,
                peer_id: PeerId([1, 2, 3]),
                local_session_id: sid(0x11),
                acks: vec![42],
                remote_session_id: sid(0x22),
                id: 9,
                payload: Bytes::from_static(b"xyz"),
            };
            // fields that the wire format does not carry for this opcode
            // must be normalized before comparing
            match opcode {
                Opcode::AckV1 => {
                    p.id = 0;
                    p.payload = Bytes::new();
                    p.peer_id = PeerId::default();
                }
                Opcode::DataV1 => {
                    p.id = 0;
                    p.acks = Vec::new();
                    p.peer_id = PeerId::default();
                    p.local_session_id = SessionId::default();
                    p.remote_session_id = SessionId::default();
                }
                Opcode::DataV2 => {
                    p.id = 0;
                    p.acks = Vec::new();
                    p.local_session_id = SessionId::default();
                    p.remote_session_id = SessionId::default();
                }
                _ => p.peer_id = PeerId::default(),
            }
            let parsed = Packet::parse(&p.serialize()).unwrap();
            assert_eq!(parsed, p, "roundtrip failed for {:?}", opcode);
        }
    }

    #[test]
    fn test_no_remote_sid_without_acks() {
        let mut p = Packet::control(Opcode::ControlV1, 0, Bytes::new());
        p.local_session_id = sid(0xaa);
        p.id = 1;
        let wire = p.serialize();
        // opcode + sid + ack count + packet id
        assert_eq!(wire.len(), 1 + 8 + 1 + 4);
    }

    #[test]
    fn test_hard_reset_server_reply_len() {
        let mut p = Packet::control(Opcode::ControlHardResetServerV2, 0, Bytes::new());
        p.local_session_id = sid(0xcc);
        p.remote_session_id = sid(0xaa);
        p.acks = vec![0];
        p.id = 0;
        assert_eq!(p.serialize().len(), HARD_RESET_SERVER_LEN);
    }

    #[test]
    fn test_data_v2_peer_id_prefix() {
        let p = Packet::data(1, Some(PeerId([0xde, 0xad, 0xbe])), Bytes::from_static(b"ct"));
        let wire = p.serialize();
        assert_eq!(wire[0] >> 3, Opcode::DataV2 as u8);
        assert_eq!(wire[0] & 0x07, 1);
        assert_eq!(&wire[1..4], &[0xde, 0xad, 0xbe]);
        assert_eq!(&wire[4..], b"ct");
    }

    #[test]
    fn test_parse_rejects_unknown_opcode() {
        assert_eq!(
            Packet::parse(&[0xff, 0x00]),
            Err(PacketError::UnknownOpcode(0x1f))
        );
    }

    #[test]
    fn test_parse_rejects_short_input() {
        // control packet truncated inside the session id
        let err = Packet::parse(&[(Opcode::ControlV1 as u8) << 3, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, PacketError::TooShort(_)));
    }

    #[test]
    fn test_parse_rejects_inconsistent_ack_array() {
        let mut wire = vec![(Opcode::AckV1 as u8) << 3];
        wire.extend_from_slice(&[0xaa; 8]);
        wire.push(4); // claims 4 acks, provides one
        wire.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(Packet::parse(&wire), Err(PacketError::BadAckArray(4)));
    }

    #[test]
    fn test_parse_rejects_payload_shorter_than_header() {
        // CONTROL_V1 with one ack but missing the remote session id
        let mut wire = vec![(Opcode::ControlV1 as u8) << 3];
        wire.extend_from_slice(&[0xaa; 8]);
        wire.push(1);
        wire.extend_from_slice(&1u32.to_be_bytes());
        let err = Packet::parse(&wire).unwrap_err();
        assert!(matches!(err, PacketError::TooShort(_)));
    }

    #[test]
    fn test_peer_id_u32_conversion() {
        let p = PeerId::from_u32(0x00aabbcc);
        assert_eq!(p.0, [0xaa, 0xbb, 0xcc]);
        assert_eq!(p.to_u32(), 0x00aabbcc);
    }

    #[test]
    fn test_key_id_masked_into_low_bits() {
        let mut p = Packet::control(Opcode::ControlV1, 5, Bytes::new());
        p.id = 3;
        let wire = p.serialize();
        assert_eq!(wire[0], ((Opcode::ControlV1 as u8) << 3) | 5);
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.key_id, 5);
    }
}
