//! Tunnel engine
//!
//! Glues the layers into a running tunnel: one task per layer, bounded
//! queues between them, a handshake driver, and the byte-oriented
//! endpoint handed to the embedding application.
//!
//! Task graph:
//! ```text
//!                    ┌────────────┐
//!   carrier ───────▶ │ nio reader │──▶ raw queue ──▶ ┌───────┐
//!                    └────────────┘                  │ muxer │──▶ bridge ──▶ TLS ──▶ driver
//!                    ┌────────────┐                  └───┬───┘
//!   carrier ◀─────── │ nio writer │◀── out queue ◀──────┤
//!                    └────────────┘                      ▼
//!                                                  data workers ◀──▶ tun endpoint
//! ```
//!
//! Control packets are never dropped; data packets may be dropped when a
//! queue is full (the protocol never retransmits them). A fatal error in
//! any task broadcasts shutdown, and `stop` returns once every task has
//! exited.

mod events;

pub use events::{ErrorKind, Event};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Proto};
use crate::control::{self, KeyExchangeConfig};
use crate::crypto::{AuthDigest, DataCipher};
use crate::data::{DataChannel, DataError, InboundData, PING_PAYLOAD};
use crate::network::{self, PacketSink, PacketSource};
use crate::packet::{Opcode, Packet};
use crate::reliable::{ReliableTransport, RetransmitConfig};
use crate::session::{KeyMaterial, NegotiationState, SessionManager, TunnelInfo};
use crate::tls::{self, TlsBridge, TlsError};
use crate::Error;

/// Capacity of each inter-task queue.
const QUEUE_CAPACITY: usize = 64;

/// Largest control payload the bridge hands the reliable transport;
/// keeps each TLS chunk inside one carrier packet.
const CONTROL_CHUNK: usize = 1024;

/// Cadence of the retransmission / delayed-ack tick.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// Capacity of the event subscription channel.
const EVENT_CAPACITY: usize = 32;

/// Key set handed from the key schedule to the data workers.
#[derive(Clone)]
struct InstalledKeys {
    cipher: DataCipher,
    digest: AuthDigest,
    material: KeyMaterial,
}

/// Shared handles every task carries.
#[derive(Clone)]
struct EngineShared {
    session: Arc<SessionManager>,
    events: broadcast::Sender<Event>,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineShared {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Tears the whole engine down over a fatal error.
    fn fatal(&self, err: Error) {
        if self.shutting_down() {
            return;
        }
        error!("fatal: {err}");
        self.session.set_state(NegotiationState::Error);
        self.emit(Event::Error(ErrorKind::from(&err)));
        let _ = self.shutdown_tx.send(true);
    }
}

/// A running tunnel: the byte-oriented endpoint over the encrypted
/// data channel.
pub struct Tunnel {
    shared: EngineShared,
    tun_in_tx: mpsc::Sender<Vec<u8>>,
    tun_out_rx: mpsc::Receiver<Vec<u8>>,
    events_rx: broadcast::Receiver<Event>,
    workers: Vec<JoinHandle<()>>,
}

impl Tunnel {
    /// Dials the configured remote and starts the engine.
    pub async fn connect(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let addr = config.remote_addr();
        match config.proto {
            Proto::Udp => {
                let (source, sink) = network::dial_udp(&addr).await?;
                Self::start(config, Box::new(source), Box::new(sink))
            }
            Proto::Tcp => {
                let (source, sink) = network::dial_tcp(&addr).await?;
                Self::start(config, Box::new(source), Box::new(sink))
            }
        }
    }

    /// Starts the engine over an already-connected carrier. The
    /// handshake runs in the background; watch [`Tunnel::next_event`] or
    /// call [`Tunnel::wait_until_ready`].
    pub fn start(
        config: Config,
        source: Box<dyn PacketSource>,
        sink: Box<dyn PacketSink>,
    ) -> Result<Self, Error> {
        Self::start_with_options(config, source, sink, RetransmitConfig::default())
    }

    /// [`Tunnel::start`] with explicit control-channel timer tuning.
    pub fn start_with_options(
        config: Config,
        source: Box<dyn PacketSource>,
        sink: Box<dyn PacketSink>,
        retransmit: RetransmitConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let session = Arc::new(SessionManager::new());
        let (events_tx, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = EngineShared { session: Arc::clone(&session), events: events_tx, shutdown_tx };

        // inter-task queues
        let (raw_tx, raw_rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);
        let (data_up_tx, data_up_rx) = mpsc::channel::<Packet>(QUEUE_CAPACITY);
        let (tun_in_tx, tun_in_rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);
        let (tun_out_tx, tun_out_rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);
        // control payloads between bridge and muxer
        let (bridge_out_tx, bridge_out_rx) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);
        let (bridge_in_tx, bridge_in_rx) = mpsc::channel::<Bytes>(QUEUE_CAPACITY);
        // key installation plumbing
        let (key_ready_tx, key_ready_rx) =
            oneshot::channel::<(InstalledKeys, oneshot::Sender<()>)>();
        let (keys_watch_tx, keys_watch_rx) = watch::channel::<Option<InstalledKeys>>(None);
        // hard-reset completion signal for the driver
        let (reset_done_tx, reset_done_rx) = oneshot::channel::<()>();

        // every task gets its shutdown receiver before any task runs, so
        // a fatal error raised immediately is never missed
        let mut workers = Vec::new();

        workers.push(tokio::spawn(reader_task(
            shared.clone(),
            shared.shutdown_tx.subscribe(),
            source,
            raw_tx,
        )));
        workers.push(tokio::spawn(writer_task(
            shared.clone(),
            shared.shutdown_tx.subscribe(),
            sink,
            out_rx,
        )));
        let muxer_shutdown = shared.shutdown_tx.subscribe();
        workers.push(tokio::spawn(muxer_task(
            MuxerState {
                shared: shared.clone(),
                rt: ReliableTransport::new(Arc::clone(&session), retransmit),
                raw_rx,
                bridge_out_rx,
                bridge_in_tx,
                data_up_tx,
                out_tx: out_tx.clone(),
                reset_done: Some(reset_done_tx),
            },
            muxer_shutdown,
        )));
        workers.push(tokio::spawn(decrypt_task(
            shared.clone(),
            shared.shutdown_tx.subscribe(),
            key_ready_rx,
            keys_watch_tx,
            data_up_rx,
            tun_out_tx,
            out_tx.clone(),
        )));
        workers.push(tokio::spawn(encrypt_task(
            shared.clone(),
            shared.shutdown_tx.subscribe(),
            keys_watch_rx,
            tun_in_rx,
            out_tx,
        )));
        workers.push(tokio::spawn(driver_task(
            shared.clone(),
            shared.shutdown_tx.subscribe(),
            config,
            reset_done_rx,
            bridge_out_tx,
            bridge_in_rx,
            key_ready_tx,
        )));

        Ok(Tunnel { shared, tun_in_tx, tun_out_rx, events_rx, workers })
    }

    /// Sends one plaintext packet out through the tunnel.
    pub async fn send(&self, packet: &[u8]) -> Result<(), Error> {
        self.tun_in_tx.send(packet.to_vec()).await.map_err(|_| Error::Closed)
    }

    /// Receives one plaintext packet from the tunnel.
    pub async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        self.tun_out_rx.recv().await.ok_or(Error::Closed)
    }

    /// Next lifecycle event; `None` once the engine is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.events_rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event subscriber lagged by {n}");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// A fresh event subscription (delivers events from now on).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Waits until the handshake finishes one way or the other.
    pub async fn wait_until_ready(&mut self) -> Result<(), Error> {
        loop {
            match self.next_event().await {
                Some(Event::Ready) => return Ok(()),
                Some(Event::Error(kind)) => return Err(Error::Fatal(kind)),
                Some(_) => continue,
                None => return Err(Error::Closed),
            }
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.shared.session.state()
    }

    pub fn tunnel_info(&self) -> TunnelInfo {
        self.shared.session.tunnel_info()
    }

    /// Shuts every task down and waits for them to exit.
    pub async fn stop(mut self) {
        let _ = self.shared.shutdown_tx.send(true);
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        info!("tunnel stopped");
    }
}

/// Reads packets off the carrier into the raw queue.
async fn reader_task(
    shared: EngineShared,
    mut shutdown: watch::Receiver<bool>,
    mut source: Box<dyn PacketSource>,
    raw_tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = source.read_packet() => match result {
                Ok(raw) => {
                    if raw_tx.send(raw).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    shared.fatal(e.into());
                    break;
                }
            },
        }
    }
    debug!("reader task done");
}

/// Drains the outbound queue onto the carrier.
async fn writer_task(
    shared: EngineShared,
    mut shutdown: watch::Receiver<bool>,
    mut sink: Box<dyn PacketSink>,
    mut out_rx: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = out_rx.recv() => {
                let Some(wire) = maybe else { break };
                if let Err(e) = sink.write_packet(&wire).await {
                    shared.fatal(e.into());
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    debug!("writer task done");
}

/// Everything the muxer loop owns.
struct MuxerState {
    shared: EngineShared,
    rt: ReliableTransport,
    raw_rx: mpsc::Receiver<Vec<u8>>,
    bridge_out_rx: mpsc::Receiver<Bytes>,
    bridge_in_tx: mpsc::Sender<Bytes>,
    data_up_tx: mpsc::Sender<Packet>,
    out_tx: mpsc::Sender<Bytes>,
    reset_done: Option<oneshot::Sender<()>>,
}

/// Classifies inbound packets, drives the reliable transport, and feeds
/// the bridge. The opening hard reset is sent from here so that its
/// retransmission rides the same tick as everything else.
async fn muxer_task(mut state: MuxerState, mut shutdown: watch::Receiver<bool>) {
    state.shared.session.set_state(NegotiationState::PreStart);
    let hello = state.rt.send_hard_reset(Instant::now());
    if state.out_tx.send(hello).await.is_err() {
        return;
    }

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut bridge_closed = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            maybe = state.raw_rx.recv() => {
                let Some(raw) = maybe else { break };
                if let Err(e) = handle_raw(&mut state, raw).await {
                    state.shared.fatal(e);
                    break;
                }
            }

            maybe = state.bridge_out_rx.recv(), if !bridge_closed && state.rt.can_send() => {
                match maybe {
                    None => bridge_closed = true,
                    Some(payload) => match state.rt.send_control(payload, Instant::now()) {
                        Ok(wire) => {
                            if state.out_tx.send(wire).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            state.shared.fatal(e.into());
                            break;
                        }
                    },
                }
            }

            _ = tick.tick() => {
                match state.rt.tick(Instant::now()) {
                    Ok(wires) => {
                        for wire in wires {
                            if state.out_tx.send(wire).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        state.shared.fatal(e.into());
                        break;
                    }
                }
            }
        }
    }
    debug!("muxer task done");
}

/// One inbound packet through classification and the reliable transport.
async fn handle_raw(state: &mut MuxerState, raw: Vec<u8>) -> Result<(), Error> {
    let packet = match Packet::parse(&raw) {
        Ok(packet) => packet,
        Err(e) => {
            // single bad packet: log and move on
            warn!("dropping malformed packet: {e}");
            return Ok(());
        }
    };

    if packet.is_data() {
        if state.data_up_tx.try_send(packet).is_err() {
            debug!("data queue full, dropping inbound packet");
        }
        return Ok(());
    }

    let mut is_hard_reset = false;
    if packet.opcode == Opcode::ControlHardResetServerV2 {
        is_hard_reset = true;
        if state.shared.session.state() >= NegotiationState::GeneratedKeys {
            return Err(Error::UnexpectedReset);
        }
        match state.shared.session.remote_session_id() {
            None => {
                state.shared.session.set_remote_session_id(packet.local_session_id);
                state.shared.session.set_state(NegotiationState::Start);
                info!("remote session id: {:?}", packet.local_session_id);
                if let Some(tx) = state.reset_done.take() {
                    let _ = tx.send(());
                }
            }
            Some(known) if known == packet.local_session_id => {
                // retransmitted reply, our ack was lost; reack below
            }
            Some(_) => return Err(Error::UnexpectedReset),
        }
    }

    for payload in state.rt.on_inbound(packet, Instant::now()) {
        // in-order control payloads feed the secure-transport bridge;
        // after the handshake the bridge may already be gone
        let _ = state.bridge_in_tx.send(payload).await;
    }

    // the hard-reset reply is acknowledged immediately, not on the
    // delayed-ack timer
    if is_hard_reset {
        for wire in state.rt.ack_now()? {
            state.out_tx.send(wire).await.map_err(|_| Error::Closed)?;
        }
    }
    Ok(())
}

/// Receives the derived keys, installs them, then decrypts inbound data
/// packets, answering keepalives and delivering plaintext to the tun
/// endpoint.
async fn decrypt_task(
    shared: EngineShared,
    mut shutdown: watch::Receiver<bool>,
    mut key_ready_rx: oneshot::Receiver<(InstalledKeys, oneshot::Sender<()>)>,
    keys_watch_tx: watch::Sender<Option<InstalledKeys>>,
    mut data_up_rx: mpsc::Receiver<Packet>,
    tun_out_tx: mpsc::Sender<Vec<u8>>,
    out_tx: mpsc::Sender<Bytes>,
) {
    let (keys, ack) = tokio::select! {
        _ = shutdown.changed() => return,
        result = &mut key_ready_rx => match result {
            Ok(pair) => pair,
            Err(_) => return,
        },
    };

    let mut dc = DataChannel::new(
        Arc::clone(&shared.session),
        keys.cipher,
        keys.digest,
        keys.material.clone(),
    );
    let _ = keys_watch_tx.send(Some(keys));
    shared.session.set_state(NegotiationState::GeneratedKeys);
    let _ = ack.send(());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = data_up_rx.recv() => {
                let Some(packet) = maybe else { break };
                match dc.decrypt_packet(&packet) {
                    Ok(InboundData::Plain(plain)) => {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            sent = tun_out_tx.send(plain) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(InboundData::Keepalive) => match dc.encrypt_packet(&PING_PAYLOAD) {
                        Ok(reply) => {
                            let _ = out_tx.try_send(reply.serialize());
                        }
                        Err(e) => {
                            shared.fatal(e.into());
                            break;
                        }
                    },
                    Err(DataError::Replay(id)) => {
                        debug!("dropping replayed data packet id={id}");
                    }
                    Err(e @ DataError::PersistentReplay(_)) => {
                        shared.fatal(e.into());
                        break;
                    }
                    Err(e) => {
                        // single-packet decrypt failure: drop and continue
                        warn!("dropping undecryptable data packet: {e}");
                    }
                }
            }
        }
    }
    debug!("decrypt task done");
}

/// Encrypts plaintext from the tun endpoint into outbound data packets.
/// Encrypted data may be dropped when the outbound queue is full.
async fn encrypt_task(
    shared: EngineShared,
    mut shutdown: watch::Receiver<bool>,
    mut keys_watch: watch::Receiver<Option<InstalledKeys>>,
    mut tun_in_rx: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<Bytes>,
) {
    // block until the key schedule installs keys
    let keys = loop {
        if let Some(keys) = keys_watch.borrow().clone() {
            break keys;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            changed = keys_watch.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    };

    let dc = DataChannel::new(Arc::clone(&shared.session), keys.cipher, keys.digest, keys.material);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = tun_in_rx.recv() => {
                let Some(plain) = maybe else { break };
                match dc.encrypt_packet(&plain) {
                    Ok(packet) => match out_tx.try_send(packet.serialize()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("outbound queue full, dropping data packet");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    Err(e) => {
                        shared.fatal(e.into());
                        break;
                    }
                }
            }
        }
    }
    debug!("encrypt task done");
}

/// Runs the handshake sequence end to end, then stays around watching
/// the control channel for server notifications.
async fn driver_task(
    shared: EngineShared,
    mut shutdown: watch::Receiver<bool>,
    config: Config,
    reset_done_rx: oneshot::Receiver<()>,
    bridge_out_tx: mpsc::Sender<Bytes>,
    bridge_in_rx: mpsc::Receiver<Bytes>,
    key_ready_tx: oneshot::Sender<(InstalledKeys, oneshot::Sender<()>)>,
) {
    let deadline = Duration::from_secs(config.handshake_timeout_secs);
    let handshake = run_handshake(
        &shared,
        &config,
        reset_done_rx,
        bridge_out_tx,
        bridge_in_rx,
        key_ready_tx,
    );

    let mut tls_stream = tokio::select! {
        _ = shutdown.changed() => return,
        result = tokio::time::timeout(deadline, handshake) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.fatal(e);
                return;
            }
            Err(_) => {
                shared.fatal(Error::HandshakeTimeout);
                return;
            }
        },
    };

    // post-handshake: the control channel stays open for notifications
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = tls_stream.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if control::is_auth_failed(&buf[..n]) {
                        shared.fatal(Error::AuthFailed);
                        break;
                    }
                    debug!("control message after handshake: {} bytes", n);
                }
            },
        }
    }
    debug!("driver task done");
}

/// The handshake proper: wait out the hard reset, run the embedded TLS
/// handshake over the bridge, exchange key material, derive and install
/// keys, then request and apply the pushed tunnel parameters.
async fn run_handshake(
    shared: &EngineShared,
    config: &Config,
    reset_done_rx: oneshot::Receiver<()>,
    bridge_out_tx: mpsc::Sender<Bytes>,
    bridge_in_rx: mpsc::Receiver<Bytes>,
    key_ready_tx: oneshot::Sender<(InstalledKeys, oneshot::Sender<()>)>,
) -> Result<tokio_rustls::client::TlsStream<tokio::io::DuplexStream>, Error> {
    shared.emit(Event::Reset);
    reset_done_rx.await.map_err(|_| Error::Closed)?;

    // embedded secure-transport handshake over the control channel
    let tls_config = Arc::new(tls::build_client_config(config)?);
    let bridge_stream = TlsBridge::start(bridge_out_tx, bridge_in_rx, CONTROL_CHUNK);
    shared.emit(Event::TlsHandshake);
    let mut tls_stream = tls::handshake(tls_config, &config.remote, bridge_stream).await?;
    info!("TLS handshake done");
    shared.emit(Event::TlsHandshakeDone);

    // key exchange
    let (username, password) = config.load_credentials()?.unwrap_or_default();
    let kx_config = KeyExchangeConfig {
        options: config.remote_options_string(),
        username,
        password,
        peer_info: config.peer_info_string(),
    };
    let message = control::encode_key_exchange(&shared.session.local_key_source(), &kx_config)?;
    tls_stream.write_all(&message).await.map_err(map_tls_io)?;
    shared.session.set_state(NegotiationState::SentKey);

    let server_kx = read_server_key_exchange(&mut tls_stream).await?;
    shared.session.set_state(NegotiationState::GotKey);
    shared.session.add_remote_key_source(server_kx.key_source)?;
    if let Some(mtu) = control::parse_remote_options_mtu(&server_kx.options) {
        shared.session.set_tunnel_mtu(mtu);
    }

    // derivation and installation
    let material = shared.session.derive_key_material()?;
    shared.session.set_state(NegotiationState::Active);
    let keys = InstalledKeys {
        cipher: DataCipher::from_suite(&config.cipher).map_err(crate::data::DataError::from)?,
        digest: AuthDigest::from_name(&config.auth).map_err(crate::data::DataError::from)?,
        material,
    };
    let (ack_tx, ack_rx) = oneshot::channel();
    key_ready_tx.send((keys, ack_tx)).map_err(|_| Error::Closed)?;
    ack_rx.await.map_err(|_| Error::Closed)?;

    // pushed tunnel parameters
    tls_stream.write_all(control::push_request()).await.map_err(map_tls_io)?;
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tls_stream.read(&mut buf).await.map_err(map_tls_io)?;
        if n == 0 {
            return Err(Error::Tls(TlsError::BridgeClosed));
        }
        let reply = &buf[..n];
        if control::is_auth_failed(reply) {
            return Err(Error::AuthFailed);
        }
        if control::is_push_reply(reply) {
            let info = control::parse_push_reply(reply)?;
            shared.session.update_tunnel_info(&info);
            break;
        }
        debug!("ignoring control message while waiting for push reply");
    }
    shared.emit(Event::DataInitDone);

    info!("tunnel handshake done");
    shared.emit(Event::Ready);
    Ok(tls_stream)
}

/// Accumulates TLS records until a complete server key exchange parses.
async fn read_server_key_exchange(
    tls_stream: &mut tokio_rustls::client::TlsStream<tokio::io::DuplexStream>,
) -> Result<control::ServerKeyExchange, Error> {
    // generous bound: a key exchange is a few hundred bytes
    const MAX_MESSAGE: usize = 64 * 1024;

    let mut message = Vec::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = tls_stream.read(&mut chunk).await.map_err(map_tls_io)?;
        if n == 0 {
            return Err(Error::Tls(TlsError::BridgeClosed));
        }
        message.extend_from_slice(&chunk[..n]);
        if control::is_auth_failed(&message) {
            return Err(Error::AuthFailed);
        }
        match control::parse_key_exchange(&message) {
            Ok(kx) => return Ok(kx),
            Err(_) if message.len() < MAX_MESSAGE => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn map_tls_io(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        return Error::Tls(TlsError::BridgeClosed);
    }
    Error::Tls(TlsError::BadHandshake(err.to_string()))
}
