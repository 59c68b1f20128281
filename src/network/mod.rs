//! Network I/O
//!
//! Owns the byte carrier under the whole engine. Datagram carriers map
//! one socket read to one packet; stream carriers frame each packet with
//! a 2-byte big-endian length prefix. Everything above this layer deals
//! in whole packets.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Packets beyond this size are malformed by definition: the stream
/// framing cannot express them.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("carrier closed")]
    CarrierClosed,

    #[error("carrier i/o: {0}")]
    CarrierIo(#[from] io::Error),

    #[error("frame too short")]
    FrameTooShort,

    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Reading side of a packet carrier.
#[async_trait]
pub trait PacketSource: Send {
    /// Reads exactly one wire packet.
    async fn read_packet(&mut self) -> Result<Vec<u8>, NetworkError>;
}

/// Writing side of a packet carrier.
#[async_trait]
pub trait PacketSink: Send {
    /// Writes exactly one wire packet.
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), NetworkError>;

    /// Closes the carrier. Safe to call more than once.
    async fn close(&mut self) -> Result<(), NetworkError>;
}

/// Datagram reader over a connected UDP socket.
pub struct DatagramSource {
    socket: Arc<UdpSocket>,
}

/// Datagram writer over a connected UDP socket.
pub struct DatagramSink {
    socket: Arc<UdpSocket>,
    closed: bool,
}

#[async_trait]
impl PacketSource for DatagramSource {
    async fn read_packet(&mut self) -> Result<Vec<u8>, NetworkError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait]
impl PacketSink for DatagramSink {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
        if self.closed {
            return Err(NetworkError::CarrierClosed);
        }
        if packet.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(packet.len()));
        }
        self.socket.send(packet).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        // dropping the last Arc closes the socket; flag keeps this idempotent
        self.closed = true;
        Ok(())
    }
}

/// Stream reader stripping the 2-byte length prefix from each packet.
pub struct StreamSource<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        StreamSource { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PacketSource for StreamSource<R> {
    async fn read_packet(&mut self) -> Result<Vec<u8>, NetworkError> {
        let mut len_buf = [0u8; 2];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(NetworkError::CarrierClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(NetworkError::FrameTooShort);
        }
        let mut packet = vec![0u8; len];
        match self.reader.read_exact(&mut packet).await {
            Ok(_) => Ok(packet),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(NetworkError::CarrierClosed),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stream writer prepending the 2-byte length prefix to each packet.
pub struct StreamSink<W> {
    writer: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        StreamSink { writer, closed: false }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketSink for StreamSink<W> {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
        if self.closed {
            return Err(NetworkError::CarrierClosed);
        }
        if packet.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(packet.len()));
        }
        // single write: length prefix and body in one syscall
        let mut wire = Vec::with_capacity(2 + packet.len());
        wire.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        wire.extend_from_slice(packet);
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        if !self.closed {
            self.closed = true;
            self.writer.shutdown().await.ok();
        }
        Ok(())
    }
}

/// Dials a UDP carrier connected to `addr`.
pub async fn dial_udp(addr: &str) -> Result<(DatagramSource, DatagramSink), NetworkError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    debug!("udp carrier: {} -> {}", socket.local_addr()?, addr);
    let socket = Arc::new(socket);
    Ok((
        DatagramSource { socket: Arc::clone(&socket) },
        DatagramSink { socket, closed: false },
    ))
}

/// Dials a TCP carrier connected to `addr`.
pub async fn dial_tcp(
    addr: &str,
) -> Result<
    (
        StreamSource<tokio::net::tcp::OwnedReadHalf>,
        StreamSink<tokio::net::tcp::OwnedWriteHalf>,
    ),
    NetworkError,
> {
    let stream = TcpStream::connect(addr).await?;
    // control packets are tiny; Nagle only adds latency here
    stream.set_nodelay(true).ok();
    debug!("tcp carrier: {} -> {}", stream.local_addr()?, addr);
    let (r, w) = stream.into_split();
    Ok((StreamSource::new(r), StreamSink::new(w)))
}
