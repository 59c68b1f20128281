//! Control-channel messages
//!
//! Encoding and parsing of the messages exchanged inside the secure
//! transport once the embedded handshake completes: the key-method-2 key
//! exchange, the push request/reply for tunnel parameters, and the
//! `AUTH_FAILED` notification. Also home to the length-prefixed option
//! string encoding these messages are built from.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::session::{KeySource, TunnelInfo};
use crate::packet::PeerId;

/// Control message errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("cannot encode option string: too long")]
    EncodeOption,

    #[error("cannot decode option string")]
    DecodeOption,

    #[error("control message too short: {0} bytes")]
    ShortMessage(usize),

    #[error("control message lacks the null header")]
    BadHeader,

    #[error("unsupported key method: {0}")]
    BadKeyMethod(u8),

    #[error("bad key source: {0}")]
    BadKeySource(#[from] crate::session::SessionError),

    #[error("expected push reply")]
    BadPushReply,
}

/// Every key-exchange message opens with four zero bytes.
const CONTROL_MESSAGE_HEADER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// The only key exchange format we speak.
const KEY_METHOD: u8 = 0x02;

/// Authentication-failure notification prefix.
const AUTH_FAILED_PREFIX: &[u8] = b"AUTH_FAILED";

/// Request for server-pushed tunnel parameters (NUL-terminated).
const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\x00";

/// Reply prefix carrying the pushed options.
const PUSH_REPLY_PREFIX: &[u8] = b"PUSH_REPLY";

/// Encodes a string with a 2-byte big-endian length prefix and a
/// trailing NUL. The length covers the string plus the NUL.
pub fn encode_option_string(s: &str) -> Result<Vec<u8>, ControlError> {
    let len = s.len() + 1;
    if len > u16::MAX as usize {
        return Err(ControlError::EncodeOption);
    }
    let mut out = Vec::with_capacity(2 + len);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0x00);
    Ok(out)
}

/// Decodes one length-prefixed option string from the head of `buf`.
/// Returns the string and the number of bytes consumed.
pub fn decode_option_string(buf: &[u8]) -> Result<(String, usize), ControlError> {
    if buf.len() < 3 {
        return Err(ControlError::DecodeOption);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len == 0 || buf.len() < 2 + len {
        return Err(ControlError::DecodeOption);
    }
    if buf[2 + len - 1] != 0x00 {
        return Err(ControlError::DecodeOption);
    }
    let s = String::from_utf8(buf[2..2 + len - 1].to_vec())
        .map_err(|_| ControlError::DecodeOption)?;
    Ok((s, 2 + len))
}

/// Credentials and option material carried in our key-exchange message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyExchangeConfig {
    /// The remote-options string describing our negotiated parameters.
    pub options: String,
    /// Username, empty when authenticating with a certificate only.
    pub username: String,
    /// Password, empty when authenticating with a certificate only.
    pub password: String,
    /// Free-form `key=value` lines advertising client properties.
    pub peer_info: String,
}

/// Builds the client key-method-2 message: null header, key method,
/// key-source bytes (pre-master plus both seeds), then the
/// length-prefixed options, username, password and peer-info.
pub fn encode_key_exchange(
    key: &KeySource,
    cfg: &KeyExchangeConfig,
) -> Result<Vec<u8>, ControlError> {
    let mut out = BytesMut::with_capacity(256);
    out.put_slice(&CONTROL_MESSAGE_HEADER);
    out.put_u8(KEY_METHOD);
    out.put_slice(&key.client_bytes());
    out.put_slice(&encode_option_string(&cfg.options)?);
    out.put_slice(&encode_option_string(&cfg.username)?);
    out.put_slice(&encode_option_string(&cfg.password)?);
    out.put_slice(&encode_option_string(&cfg.peer_info)?);
    Ok(out.to_vec())
}

/// The server's half of the key exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerKeyExchange {
    pub key_source: KeySource,
    /// The server's remote-options string.
    pub options: String,
}

/// Parses the server key-method-2 message: null header, key method,
/// two 32-byte seeds, then the server's options string.
pub fn parse_key_exchange(data: &[u8]) -> Result<ServerKeyExchange, ControlError> {
    if data.len() < 5 {
        return Err(ControlError::ShortMessage(data.len()));
    }
    if !is_control_message(data) {
        return Err(ControlError::BadHeader);
    }
    if data[4] != KEY_METHOD {
        return Err(ControlError::BadKeyMethod(data[4]));
    }
    let mut buf = &data[5..];
    let key_source = KeySource::parse_remote(buf)?;
    buf.advance(2 * crate::session::RANDOM_LEN);
    let (options, _) = decode_option_string(buf)?;
    Ok(ServerKeyExchange { key_source, options })
}

/// True when `data` opens with the four-zero-byte message header.
pub fn is_control_message(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == CONTROL_MESSAGE_HEADER
}

/// True when the server notified us that authentication failed.
pub fn is_auth_failed(data: &[u8]) -> bool {
    data.starts_with(AUTH_FAILED_PREFIX)
}

/// The push-request message asking the server for tunnel parameters.
pub fn push_request() -> &'static [u8] {
    PUSH_REQUEST
}

/// True when `data` is a reply to our push request.
pub fn is_push_reply(data: &[u8]) -> bool {
    data.starts_with(PUSH_REPLY_PREFIX)
}

/// Parses the comma-separated options of a `PUSH_REPLY` into the tunnel
/// parameters we track: `ifconfig`, `route-gateway` (with `route` as a
/// fallback), `peer-id` and `tun-mtu`.
pub fn parse_push_reply(data: &[u8]) -> Result<TunnelInfo, ControlError> {
    if !is_push_reply(data) {
        return Err(ControlError::BadPushReply);
    }
    let text = String::from_utf8_lossy(&data[PUSH_REPLY_PREFIX.len()..]);
    let mut ti = TunnelInfo::default();
    let mut route_fallback_gw = String::new();

    for opt in text.trim_matches(|c| c == ',' || c == '\0').split(',') {
        let mut parts = opt.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let vals: Vec<&str> = parts.collect();
        match key {
            "ifconfig" => {
                if let Some(ip) = vals.first() {
                    ti.ip = ip.to_string();
                }
                if let Some(mask) = vals.get(1) {
                    ti.netmask = mask.to_string();
                }
            }
            "route-gateway" => {
                if let Some(gw) = vals.first() {
                    ti.gateway = gw.to_string();
                }
            }
            "route" => {
                if let Some(gw) = vals.first() {
                    route_fallback_gw = gw.to_string();
                }
            }
            "peer-id" => {
                if let Some(Ok(id)) = vals.first().map(|v| v.parse::<u32>()) {
                    ti.peer_id = Some(PeerId::from_u32(id));
                }
            }
            "tun-mtu" => {
                if let Some(Ok(mtu)) = vals.first().map(|v| v.parse::<u16>()) {
                    ti.mtu = mtu;
                }
            }
            _ => {}
        }
    }
    if ti.gateway.is_empty() {
        ti.gateway = route_fallback_gw;
    }
    Ok(ti)
}

/// Extracts `tun-mtu` from a remote-options string
/// (`"…,tun-mtu 1500,…"`).
pub fn parse_remote_options_mtu(options: &str) -> Option<u16> {
    for opt in options.split(',') {
        let mut parts = opt.split_whitespace();
        if parts.next() == Some("tun-mtu") {
            if let Some(Ok(mtu)) = parts.next().map(|v| v.parse::<u16>()) {
                return Some(mtu);
            }
        }
    }
    None
}
