//! Reliable control-channel transport
//!
//! The control channel runs over the same unreliable carrier as the data
//! channel, so this layer supplies what the embedded secure transport
//! expects underneath: monotone packet ids, retransmission with
//! exponential backoff, duplicate suppression, acknowledgments
//! (piggybacked on outbound control packets or sent standalone), and
//! strictly in-order upward delivery.
//!
//! The state machine is synchronous and takes explicit `Instant`s; the
//! engine drives it from its reader loop and a periodic tick.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::packet::{Packet, PacketId};
use crate::session::{SessionError, SessionManager};

/// Reliable transport errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReliableError {
    /// The peer stopped acknowledging us entirely.
    #[error("peer unresponsive after {0} attempts")]
    PeerUnresponsive(u32),

    /// The in-flight window is full; retry after the next ack.
    #[error("send window full")]
    WindowFull,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Retransmission and acknowledgment tuning.
#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    /// Backoff for the first retransmission.
    pub initial_timeout: Duration,
    /// Backoff ceiling.
    pub max_timeout: Duration,
    /// Total transmissions (first send included) before giving up.
    pub max_attempts: u32,
    /// How long received ids may wait before a standalone `ACK_V1`.
    pub ack_delay: Duration,
    /// Maximum outstanding control packets.
    pub window: usize,
    /// Acks piggybacked per outbound control packet.
    pub max_piggyback_acks: usize,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(60),
            max_attempts: 10,
            ack_delay: Duration::from_millis(50),
            window: 8,
            max_piggyback_acks: 4,
        }
    }
}

/// An unacknowledged outbound packet, resent verbatim.
struct Outstanding {
    wire: Bytes,
    next_retry: Instant,
    backoff: Duration,
    attempts: u32,
}

/// The control-channel reliability state machine.
pub struct ReliableTransport {
    session: Arc<SessionManager>,
    config: RetransmitConfig,
    /// Outstanding packets, keyed and resent by id.
    tx_unacked: BTreeMap<PacketId, Outstanding>,
    /// Next inbound id to deliver. Starts at 0: the hard-reset reply.
    rx_expected: PacketId,
    /// Out-of-order arrivals with id > `rx_expected`.
    rx_reorder: BTreeMap<PacketId, Packet>,
    /// Received ids not yet acknowledged to the peer.
    pending_acks: VecDeque<PacketId>,
    /// When the oldest pending ack started waiting.
    acks_pending_since: Option<Instant>,
}

impl ReliableTransport {
    pub fn new(session: Arc<SessionManager>, config: RetransmitConfig) -> Self {
        ReliableTransport {
            session,
            config,
            tx_unacked: BTreeMap::new(),
            rx_expected: 0,
            rx_reorder: BTreeMap::new(),
            pending_acks: VecDeque::new(),
            acks_pending_since: None,
        }
    }

    /// Room left in the in-flight window.
    pub fn can_send(&self) -> bool {
        self.tx_unacked.len() < self.config.window
    }

    pub fn outstanding(&self) -> usize {
        self.tx_unacked.len()
    }

    /// Wraps `payload` in a `CONTROL_V1` with the next id, piggybacks any
    /// pending acks, and registers it for retransmission. Returns the
    /// serialized packet to write.
    pub fn send_control(&mut self, payload: Bytes, now: Instant) -> Result<Bytes, ReliableError> {
        if !self.can_send() {
            return Err(ReliableError::WindowFull);
        }
        let mut packet = self.session.new_control_packet(payload)?;
        // acks require the remote session id on the wire
        if self.session.remote_session_id().is_some() {
            packet.acks = self.drain_pending_acks(self.config.max_piggyback_acks);
        }
        let wire = packet.serialize();
        trace!("control send: id={} acks={:?}", packet.id, packet.acks);
        self.register(packet.id, wire.clone(), now);
        Ok(wire)
    }

    /// Registers the opening hard reset (id 0) for retransmission and
    /// returns its serialized form.
    pub fn send_hard_reset(&mut self, now: Instant) -> Bytes {
        let packet = self.session.new_hard_reset_packet();
        let wire = packet.serialize();
        self.register(0, wire.clone(), now);
        wire
    }

    fn register(&mut self, id: PacketId, wire: Bytes, now: Instant) {
        self.tx_unacked.insert(
            id,
            Outstanding {
                wire,
                next_retry: now + self.config.initial_timeout,
                backoff: self.config.initial_timeout,
                attempts: 1,
            },
        );
    }

    /// Feeds one inbound control-class packet (control, hard-reset reply
    /// or ack) through the state machine. Returns the payloads that are
    /// now deliverable upward, in packet-id order.
    pub fn on_inbound(&mut self, packet: Packet, now: Instant) -> Vec<Bytes> {
        let mut delivered = Vec::new();

        // any control-class packet may carry acks for our outstanding ones
        for ack in &packet.acks {
            if self.tx_unacked.remove(ack).is_some() {
                trace!("acked: id={}", ack);
            }
        }
        if packet.is_ack() {
            return delivered;
        }

        let id = packet.id;
        self.note_ack_needed(id, now);

        if id < self.rx_expected {
            // already delivered; the peer may have lost our ack
            debug!("duplicate control packet id={} (expected {})", id, self.rx_expected);
            return delivered;
        }
        if id > self.rx_expected {
            trace!("buffering out-of-order control packet id={}", id);
            self.rx_reorder.insert(id, packet);
            return delivered;
        }

        // in sequence: deliver, then drain whatever queued behind it
        self.deliver(packet, &mut delivered);
        while let Some(next) = self.rx_reorder.remove(&self.rx_expected) {
            self.deliver(next, &mut delivered);
        }
        delivered
    }

    fn deliver(&mut self, packet: Packet, delivered: &mut Vec<Bytes>) {
        if !packet.payload.is_empty() {
            delivered.push(packet.payload);
        }
        self.rx_expected += 1;
    }

    fn note_ack_needed(&mut self, id: PacketId, now: Instant) {
        if !self.pending_acks.contains(&id) {
            self.pending_acks.push_back(id);
        }
        self.acks_pending_since.get_or_insert(now);
    }

    fn drain_pending_acks(&mut self, max: usize) -> Vec<PacketId> {
        let n = self.pending_acks.len().min(max);
        let acks: Vec<PacketId> = self.pending_acks.drain(..n).collect();
        if self.pending_acks.is_empty() {
            self.acks_pending_since = None;
        }
        acks
    }

    /// Drives retransmission and delayed acknowledgment. Returns the
    /// packets to write; fails once a packet exhausts its attempts.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Bytes>, ReliableError> {
        let mut to_send = Vec::new();

        for (id, out) in self.tx_unacked.iter_mut() {
            if now < out.next_retry {
                continue;
            }
            if out.attempts >= self.config.max_attempts {
                warn!("giving up on control packet id={} after {} attempts", id, out.attempts);
                return Err(ReliableError::PeerUnresponsive(out.attempts));
            }
            out.attempts += 1;
            out.backoff = (out.backoff * 2).min(self.config.max_timeout);
            out.next_retry = now + out.backoff;
            debug!("retransmit: id={} attempt={} backoff={:?}", id, out.attempts, out.backoff);
            to_send.push(out.wire.clone());
        }

        to_send.extend(self.flush_acks(now)?);
        Ok(to_send)
    }

    /// Emits a standalone `ACK_V1` when acks have waited past the delay
    /// window without a control packet to ride on.
    pub fn flush_acks(&mut self, now: Instant) -> Result<Vec<Bytes>, ReliableError> {
        let Some(since) = self.acks_pending_since else {
            return Ok(Vec::new());
        };
        if now.duration_since(since) < self.config.ack_delay {
            return Ok(Vec::new());
        }
        self.ack_now()
    }

    /// Emits a standalone `ACK_V1` immediately. Used for the hard-reset
    /// reply, which the peer expects acknowledged without delay.
    pub fn ack_now(&mut self) -> Result<Vec<Bytes>, ReliableError> {
        if self.pending_acks.is_empty() {
            return Ok(Vec::new());
        }
        let acks = self.drain_pending_acks(u8::MAX as usize);
        let packet = self.session.new_ack_packet(acks)?;
        trace!("standalone ack: {:?}", packet.acks);
        Ok(vec![packet.serialize()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Opcode, SessionId};
    use crate::session::{KeySource, PRE_MASTER_LEN, RANDOM_LEN};

    fn test_session() -> Arc<SessionManager> {
        let s = SessionManager::with_parts(
            SessionId([0xaa; 8]),
            KeySource::from_parts([1; PRE_MASTER_LEN], [2; RANDOM_LEN], [3; RANDOM_LEN]),
        );
        s.set_remote_session_id(SessionId([0xbb; 8]));
        Arc::new(s)
    }

    fn rt() -> ReliableTransport {
        ReliableTransport::new(test_session(), RetransmitConfig::default())
    }

    fn control_in(id: PacketId, payload: &'static [u8]) -> Packet {
        let mut p = Packet::control(Opcode::ControlV1, 0, Bytes::from_static(payload));
        p.local_session_id = SessionId([0xbb; 8]);
        p.id = id;
        p
    }

    fn ack_in(ids: Vec<PacketId>) -> Packet {
        let mut p = Packet::control(Opcode::AckV1, 0, Bytes::new());
        p.local_session_id = SessionId([0xbb; 8]);
        p.remote_session_id = SessionId([0xaa; 8]);
        p.acks = ids;
        p
    }

    #[test]
    fn test_in_order_delivery() {
        let mut rt = rt();
        let now = Instant::now();
        rt.rx_expected = 1; // past the hard-reset slot

        let out = rt.on_inbound(control_in(1, b"one"), now);
        assert_eq!(out, vec![Bytes::from_static(b"one")]);
        let out = rt.on_inbound(control_in(2, b"two"), now);
        assert_eq!(out, vec![Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_reordered_delivery() {
        let mut rt = rt();
        let now = Instant::now();
        rt.rx_expected = 1;

        let mut delivered = Vec::new();
        for (id, payload) in [(1u32, b"a" as &'static [u8]), (3, b"c"), (2, b"b"), (4, b"d")] {
            let mut p = Packet::control(Opcode::ControlV1, 0, Bytes::from_static(payload));
            p.id = id;
            delivered.extend(rt.on_inbound(p, now));
        }
        assert_eq!(
            delivered,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
                Bytes::from_static(b"d"),
            ]
        );
    }

    #[test]
    fn test_duplicates_delivered_once_but_reacked() {
        let mut rt = rt();
        let now = Instant::now();
        rt.rx_expected = 1;

        assert_eq!(rt.on_inbound(control_in(1, b"x"), now).len(), 1);
        // duplicate: no second delivery, but the id queues for re-ack
        assert!(rt.on_inbound(control_in(1, b"x"), now).is_empty());
        assert!(rt.pending_acks.contains(&1));
    }

    #[test]
    fn test_ack_shrinks_tx_unacked() {
        let mut rt = rt();
        let now = Instant::now();

        rt.send_control(Bytes::from_static(b"c1"), now).unwrap();
        rt.send_control(Bytes::from_static(b"c2"), now).unwrap();
        assert_eq!(rt.outstanding(), 2);

        // unrelated ack changes nothing
        rt.on_inbound(ack_in(vec![9]), now);
        assert_eq!(rt.outstanding(), 2);

        rt.on_inbound(ack_in(vec![1]), now);
        assert_eq!(rt.outstanding(), 1);
        rt.on_inbound(ack_in(vec![2]), now);
        assert_eq!(rt.outstanding(), 0);
    }

    #[test]
    fn test_hard_reset_cleared_by_piggybacked_ack() {
        let mut rt = rt();
        let now = Instant::now();
        let wire = rt.send_hard_reset(now);
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.opcode, Opcode::ControlHardResetClientV2);
        assert_eq!(parsed.id, 0);
        assert_eq!(rt.outstanding(), 1);

        // the server reply acks id 0 in its ack array
        let mut reply = Packet::control(Opcode::ControlHardResetServerV2, 0, Bytes::new());
        reply.id = 0;
        reply.acks = vec![0];
        let out = rt.on_inbound(reply, now);
        assert_eq!(rt.outstanding(), 0);
        assert!(out.is_empty()); // empty payload is not delivered
        assert_eq!(rt.rx_expected, 1); // but it consumes sequence slot 0
    }

    #[test]
    fn test_retransmit_backoff_and_give_up() {
        let mut rt = rt();
        let t0 = Instant::now();
        rt.send_control(Bytes::from_static(b"c"), t0).unwrap();

        // nothing before the first timeout
        assert!(rt.tick(t0 + Duration::from_millis(1900)).unwrap().is_empty());

        // first retransmission at 2s; backoff doubles to 4s
        let sent = rt.tick(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(sent.len(), 1);
        assert!(rt
            .tick(t0 + Duration::from_secs(2) + Duration::from_secs(3))
            .unwrap()
            .is_empty());

        // walk the clock through the remaining attempts
        let mut now = t0 + Duration::from_secs(2);
        let mut transmissions = 2u32; // original + first retry
        loop {
            now += Duration::from_secs(3600); // far past any backoff
            match rt.tick(now) {
                Ok(sent) if sent.len() == 1 => transmissions += 1,
                Ok(_) => panic!("expected a retransmission or failure"),
                Err(ReliableError::PeerUnresponsive(attempts)) => {
                    assert_eq!(attempts, 10);
                    assert_eq!(transmissions, 10);
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_backoff_capped() {
        let cfg = RetransmitConfig {
            max_attempts: 100,
            ..RetransmitConfig::default()
        };
        let mut rt = ReliableTransport::new(test_session(), cfg);
        let t0 = Instant::now();
        rt.send_control(Bytes::from_static(b"c"), t0).unwrap();

        let mut now = t0;
        for _ in 0..10 {
            now += Duration::from_secs(3600);
            rt.tick(now).unwrap();
        }
        assert_eq!(rt.tx_unacked.values().next().unwrap().backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_window_capacity() {
        let mut rt = rt();
        let now = Instant::now();
        for _ in 0..8 {
            rt.send_control(Bytes::from_static(b"c"), now).unwrap();
        }
        assert!(!rt.can_send());
        assert_eq!(
            rt.send_control(Bytes::from_static(b"c"), now),
            Err(ReliableError::WindowFull)
        );
        rt.on_inbound(ack_in(vec![1]), now);
        assert!(rt.can_send());
    }

    #[test]
    fn test_standalone_ack_after_delay() {
        let mut rt = rt();
        let t0 = Instant::now();
        rt.rx_expected = 1;
        rt.on_inbound(control_in(1, b"payload"), t0);

        // before the delay: no ack yet
        assert!(rt.tick(t0 + Duration::from_millis(10)).unwrap().is_empty());

        // past the delay: one standalone ACK_V1 carrying id 1
        let sent = rt.tick(t0 + Duration::from_millis(60)).unwrap();
        assert_eq!(sent.len(), 1);
        let ack = Packet::parse(&sent[0]).unwrap();
        assert_eq!(ack.opcode, Opcode::AckV1);
        assert_eq!(ack.acks, vec![1]);

        // acks drained; nothing further
        assert!(rt.tick(t0 + Duration::from_millis(200)).unwrap().is_empty());
    }

    #[test]
    fn test_ack_now_skips_the_delay() {
        let mut rt = rt();
        let now = Instant::now();
        rt.rx_expected = 1;
        rt.on_inbound(control_in(1, b"p"), now);

        let sent = rt.ack_now().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(Packet::parse(&sent[0]).unwrap().acks, vec![1]);
        assert!(rt.ack_now().unwrap().is_empty());
    }

    #[test]
    fn test_acks_piggyback_on_outbound_control() {
        let mut rt = rt();
        let now = Instant::now();
        rt.rx_expected = 1;
        for id in 1..=6 {
            rt.on_inbound(control_in(id, b"p"), now);
        }

        let wire = rt.send_control(Bytes::from_static(b"out"), now).unwrap();
        let packet = Packet::parse(&wire).unwrap();
        assert_eq!(packet.acks, vec![1, 2, 3, 4]); // capped at 4
        assert_eq!(rt.pending_acks.len(), 2); // 5 and 6 still pending
    }
}
