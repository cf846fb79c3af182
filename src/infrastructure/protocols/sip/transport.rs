//! SIP transport layer - UDP datagrams and framed TCP streams
//!
//! Each listening socket has one reader task. Readers parse the framing
//! only and hand messages to the dispatcher over an mpsc channel; header
//! validation happens there so a 400 can still be sent. Bytes that do not
//! parse at all are logged and dropped.

use super::message::{frame_length, SipError, SipMessage};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest message accepted on a stream before the connection is dropped
const MAX_STREAM_MESSAGE: usize = 64 * 1024;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Whether retransmission timers apply
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
}

impl OutgoingMessage {
    pub fn new(data: Bytes, destination: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            data,
            destination,
            protocol,
        }
    }

    /// Parse the payload back, mostly for inspection in tests and logs
    pub fn parse(&self) -> Result<SipMessage, SipError> {
        SipMessage::parse(&self.data)
    }
}

/// Anything that can put a SIP message on the wire
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SipSender: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_datagram(data: &[u8], source: SocketAddr) -> Option<SipMessage> {
    // Keep-alive pings are bare CRLFs
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match SipMessage::parse_unvalidated(data) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Dropping unparseable message from {}: {}", source, e);
            None
        }
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket {}: {}", addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        info!("UDP transport listening on {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sender(&self) -> UdpSender {
        UdpSender {
            socket: self.socket.clone(),
        }
    }

    /// Reader loop; returns when cancelled or the dispatcher goes away.
    /// Receive errors (ICMP unreachable and the like) are logged and skipped.
    pub async fn run(self, tx: mpsc::Sender<IncomingMessage>, cancel: CancellationToken) {
        let mut buf = vec![0u8; 65535];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    let Some(message) = parse_datagram(&buf[..size], source) else {
                        continue;
                    };
                    let incoming = IncomingMessage {
                        message,
                        source,
                        protocol: TransportProtocol::Udp,
                    };
                    if tx.send(incoming).await.is_err() {
                        debug!("Dispatcher closed, stopping UDP reader");
                        break;
                    }
                }
                Err(e) => {
                    warn!("UDP receive error on {}: {}", self.local_addr, e);
                }
            }
        }
        info!("UDP transport on {} stopped", self.local_addr);
    }
}

#[derive(Clone)]
pub struct UdpSender {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl SipSender for UdpSender {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!("Sending {} bytes to {} via UDP", message.data.len(), message.destination);
        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }
}

type ConnectionTable = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>>;

/// TCP transport implementation
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionTable,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, SipError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind TCP listener {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        info!("TCP transport listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends over accepted connections only; there is no outbound connect
    pub fn sender(&self) -> TcpSender {
        TcpSender {
            connections: self.connections.clone(),
        }
    }

    pub async fn run(self, tx: mpsc::Sender<IncomingMessage>, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.listener.accept() => r,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted TCP connection from {}", peer);
                    let (write_tx, write_rx) = mpsc::unbounded_channel();
                    lock(&self.connections).insert(peer, write_tx);
                    tokio::spawn(Self::connection(
                        stream,
                        peer,
                        write_rx,
                        tx.clone(),
                        self.connections.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
        info!("TCP transport on {} stopped", self.local_addr);
    }

    async fn connection(
        stream: TcpStream,
        peer: SocketAddr,
        mut outgoing: mpsc::UnboundedReceiver<Bytes>,
        tx: mpsc::Sender<IncomingMessage>,
        connections: ConnectionTable,
        cancel: CancellationToken,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                data = outgoing.recv() => {
                    let Some(data) = data else { break };
                    if let Err(e) = writer.write_all(&data).await {
                        warn!("TCP write to {} failed: {}", peer, e);
                        break;
                    }
                }
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!("TCP connection from {} closed", peer);
                            break;
                        }
                        Ok(_) => {
                            if !Self::drain_frames(&mut buf, peer, &tx).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("TCP read from {} failed: {}", peer, e);
                            break;
                        }
                    }
                }
            }
        }

        lock(&connections).remove(&peer);
    }

    /// Deliver every complete message in `buf`. Returns false when the
    /// connection should be dropped.
    async fn drain_frames(buf: &mut BytesMut, peer: SocketAddr, tx: &mpsc::Sender<IncomingMessage>) -> bool {
        loop {
            let length = match frame_length(buf) {
                Ok(Some(length)) => length,
                Ok(None) => {
                    if buf.len() > MAX_STREAM_MESSAGE {
                        warn!("Oversized message from {}, closing connection", peer);
                        return false;
                    }
                    return true;
                }
                Err(e) => {
                    warn!("Unframeable stream from {}: {}", peer, e);
                    return false;
                }
            };

            let frame = buf.split_to(length).freeze();
            let Some(message) = parse_datagram(&frame, peer) else {
                continue;
            };
            let incoming = IncomingMessage {
                message,
                source: peer,
                protocol: TransportProtocol::Tcp,
            };
            if tx.send(incoming).await.is_err() {
                return false;
            }
            if buf.is_empty() {
                return true;
            }
        }
    }
}

#[derive(Clone)]
pub struct TcpSender {
    connections: ConnectionTable,
}

#[async_trait]
impl SipSender for TcpSender {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let connection = lock(&self.connections).get(&message.destination).cloned();
        let connection = connection.ok_or_else(|| {
            SipError::TransportError(format!("No TCP connection to {}", message.destination))
        })?;
        connection
            .send(message.data)
            .map_err(|_| SipError::TransportError(format!("TCP connection to {} closed", message.destination)))
    }
}

/// Routes each message to the transport it names
#[derive(Clone)]
pub struct TransportSet {
    udp: Arc<dyn SipSender>,
    tcp: Option<Arc<dyn SipSender>>,
}

impl TransportSet {
    pub fn new(udp: Arc<dyn SipSender>, tcp: Option<Arc<dyn SipSender>>) -> Self {
        Self { udp, tcp }
    }
}

#[async_trait]
impl SipSender for TransportSet {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        match (message.protocol, &self.tcp) {
            (TransportProtocol::Tcp, Some(tcp)) => tcp.send(message).await,
            (TransportProtocol::Tcp, None) => Err(SipError::TransportError("TCP transport disabled".to_string())),
            (TransportProtocol::Udp, _) => self.udp.send(message).await,
        }
    }
}

/// In-memory transport: every message sent is delivered to a channel.
/// Used to drive the core without sockets.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl ChannelSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SipSender for ChannelSender {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        self.tx
            .send(message)
            .map_err(|_| SipError::TransportError("capture channel closed".to_string()))
    }
}
