//! TCP Transport
//!
//! Length-prefixed [`WireFrame`]s over a `TcpStream`. After the handshake the
//! stream is split: a reader task delivers frames to the event sink, a writer
//! task drains an unbounded queue, so `send_frame` never waits on the socket
//! and frames leave in call order.

use super::{
    next_transport_id, ConnectionAddress, EstablishedTransport, Transport, TransportConnector, TransportEvent,
    TransportEventSink, TransportStats,
};
use crate::config::TcpConfig;
use crate::error::{CommsError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use comms_codec::{frame_length, HandshakeRequest, HandshakeStatus, ProtocolError, WireFrame, FRAME_LENGTH_PREFIX};
use comms_types::ConnectionId;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Read one frame; returns the frame and its size on the wire
pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<(WireFrame, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_LENGTH_PREFIX];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| CommsError::io("Failed to read frame length", e))?;
    let length = frame_length(prefix, max_frame_size)?;

    let mut body = BytesMut::zeroed(length);
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CommsError::io("Failed to read frame body", e))?;
    let frame = WireFrame::decode(body.freeze())?;
    Ok((frame, FRAME_LENGTH_PREFIX + length))
}

/// Write one frame and flush
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &WireFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| CommsError::io("Failed to write frame", e))?;
    writer.flush().await.map_err(|e| CommsError::io("Failed to flush frame", e))
}

enum Outbound {
    Frame(Bytes),
    Shutdown,
}

struct Halves {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    queue: mpsc::UnboundedReceiver<Outbound>,
}

/// One handshaken TCP connection
pub struct TcpTransport {
    id: u64,
    connection_id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    max_frame_size: usize,
    sink: Weak<dyn TransportEventSink>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<Option<Halves>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    closing: AtomicBool,
    terminated: AtomicBool,
    last_received: Mutex<Instant>,
    probes: AtomicU32,
    probe_nonce: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TcpTransport {
    /// Wrap a stream whose handshake has completed
    pub fn new(
        stream: TcpStream,
        connection_id: ConnectionId,
        sink: Weak<dyn TransportEventSink>,
        max_frame_size: usize,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| CommsError::io("Failed to read peer address", e))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| CommsError::io("Failed to read local address", e))?;
        let (read, write) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            id: next_transport_id(),
            connection_id,
            peer_addr,
            local_addr,
            max_frame_size,
            sink,
            outbound,
            pending: Mutex::new(Some(Halves { read, write, queue })),
            reader: Mutex::new(None),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            last_received: Mutex::new(Instant::now()),
            probes: AtomicU32::new(0),
            probe_nonce: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }))
    }

    fn note_received(&self, bytes: usize) {
        *self.last_received.lock() = Instant::now();
        self.probes.store(0, Ordering::Release);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Fire the single terminal event
    fn terminate(&self, event: TransportEvent) {
        self.connected.store(false, Ordering::Release);
        let _ = self.outbound.send(Outbound::Shutdown);
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(transport = self.id, peer = %self.peer_addr, ?event, "Transport terminated");
        if let Some(sink) = self.sink.upgrade() {
            sink.on_transport_event(self.id, event);
        }
    }

    fn stop_reader(&self) {
        // never started: dropping the halves closes the socket
        drop(self.pending.lock().take());
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    async fn read_loop(self: Arc<Self>, mut read: OwnedReadHalf) {
        loop {
            let (frame, size) = match read_frame(&mut read, self.max_frame_size).await {
                Ok(received) => received,
                Err(e) => {
                    if self.closing.load(Ordering::Acquire) {
                        self.terminate(TransportEvent::Closed);
                    } else {
                        match &e {
                            CommsError::Io { .. } => debug!(transport = self.id, peer = %self.peer_addr, error = %e, "Connection lost"),
                            _ => error!(transport = self.id, peer = %self.peer_addr, error = %e, "Framing error; dropping connection"),
                        }
                        self.terminate(TransportEvent::Disconnected);
                    }
                    return;
                }
            };
            self.note_received(size);

            match frame {
                WireFrame::Message(message) => match self.sink.upgrade() {
                    Some(sink) => sink.on_message(self.id, message),
                    None => {
                        debug!(transport = self.id, "Channel dropped; closing transport");
                        self.close();
                        return;
                    }
                },
                WireFrame::Ping(nonce) => {
                    trace!(transport = self.id, nonce, "Answering health ping");
                    let _ = self.send_frame(WireFrame::Pong(nonce));
                }
                WireFrame::Pong(nonce) => trace!(transport = self.id, nonce, "Health pong"),
                WireFrame::Goodbye => {
                    debug!(transport = self.id, peer = %self.peer_addr, "Peer said goodbye");
                    self.closing.store(true, Ordering::Release);
                    self.terminate(TransportEvent::Closed);
                    return;
                }
                WireFrame::Handshake(_) | WireFrame::HandshakeAck(_) => {
                    warn!(transport = self.id, peer = %self.peer_addr, "Handshake frame on established connection");
                    self.terminate(TransportEvent::Disconnected);
                    return;
                }
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut write: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = queue.recv().await {
            match outbound {
                Outbound::Frame(bytes) => {
                    if let Err(e) = write.write_all(&bytes).await {
                        if !self.closing.load(Ordering::Acquire) {
                            debug!(transport = self.id, peer = %self.peer_addr, error = %e, "Write failed");
                            self.stop_reader();
                            self.terminate(TransportEvent::Disconnected);
                        }
                        return;
                    }
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                    self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Outbound::Shutdown => break,
            }
        }
        let _ = write.shutdown().await;
    }
}

impl Transport for TcpTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn start(self: Arc<Self>) {
        let Some(Halves { read, write, queue }) = self.pending.lock().take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(transport = self.id, "No tokio runtime; transport cannot start");
            self.terminate(TransportEvent::Disconnected);
            return;
        };
        runtime.spawn(Arc::clone(&self).write_loop(write, queue));
        let reader = runtime.spawn(Arc::clone(&self).read_loop(read));
        *self.reader.lock() = Some(reader);
        // closed while starting
        if self.closing.load(Ordering::Acquire) {
            self.stop_reader();
        }
    }

    fn send_frame(&self, frame: WireFrame) -> Result<usize> {
        if !self.is_connected() {
            return Err(CommsError::channel_closed(format!("transport {}", self.id)));
        }
        let bytes = frame.encode()?;
        let size = bytes.len();
        if size - FRAME_LENGTH_PREFIX > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: size - FRAME_LENGTH_PREFIX,
                max: self.max_frame_size,
            }
            .into());
        }
        self.outbound
            .send(Outbound::Frame(bytes))
            .map_err(|_| CommsError::channel_closed(format!("transport {}", self.id)))?;
        Ok(size)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.connected.load(Ordering::Acquire) {
            if let Ok(goodbye) = WireFrame::Goodbye.encode() {
                let _ = self.outbound.send(Outbound::Frame(goodbye));
            }
        }
        self.stop_reader();
        self.terminate(TransportEvent::Closed);
    }

    fn drop_connection(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_reader();
        self.terminate(TransportEvent::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection_id.clone()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn idle_for(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    fn outstanding_probes(&self) -> u32 {
        self.probes.load(Ordering::Acquire)
    }

    fn send_probe(&self) -> Result<()> {
        let nonce = self.probe_nonce.fetch_add(1, Ordering::Relaxed);
        // counted before sending so a fast pong cannot be overtaken
        self.probes.fetch_add(1, Ordering::AcqRel);
        self.send_frame(WireFrame::Ping(nonce)).map(|_| ())
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Client-side connect and handshake over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    async fn resolve(address: &ConnectionAddress) -> Result<Vec<SocketAddr>> {
        let resolved: Vec<SocketAddr> = lookup_host((address.host.as_str(), address.port))
            .await
            .map_err(|e| CommsError::unknown_host(address.host.clone(), Some(e)))?
            .collect();
        if resolved.is_empty() {
            return Err(CommsError::unknown_host(address.host.clone(), None));
        }
        Ok(resolved)
    }

    async fn establish(
        &self,
        address: &ConnectionAddress,
        request: HandshakeRequest,
        sink: Weak<dyn TransportEventSink>,
    ) -> Result<EstablishedTransport> {
        let mut last_error = None;
        let mut connected = None;
        for candidate in Self::resolve(address).await? {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!(addr = %candidate, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        let mut stream = connected.ok_or_else(|| {
            CommsError::io(
                format!("Failed to connect to {address}"),
                last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address connected")),
            )
        })?;
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        write_frame(&mut stream, &WireFrame::Handshake(request)).await?;
        let (frame, _) = read_frame(&mut stream, self.config.max_frame_size).await?;
        let response = match frame {
            WireFrame::HandshakeAck(response) => response,
            other => {
                return Err(ProtocolError::invalid_field(
                    "handshake",
                    format!("expected handshake ack, got {:?}", other.kind()),
                )
                .into())
            }
        };

        let detail = response.detail;
        match response.status {
            HandshakeStatus::Ok => {}
            HandshakeStatus::MaxConnectionsExceeded => return Err(CommsError::MaxConnectionsExceeded { detail }),
            HandshakeStatus::StackMismatch => return Err(CommsError::StackMismatch { detail }),
            HandshakeStatus::ReconnectionRejected => return Err(CommsError::ReconnectionRejected { detail }),
            HandshakeStatus::Rejected => return Err(CommsError::Rejected { detail }),
        }

        let transport = TcpTransport::new(stream, response.connection_id, sink, self.config.max_frame_size)?;
        debug!(
            transport = transport.id(),
            peer = %transport.remote_addr(),
            server = %response.server_id,
            "Transport handshake complete"
        );
        Ok(EstablishedTransport {
            transport,
            server_id: response.server_id,
        })
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(
        &self,
        address: &ConnectionAddress,
        request: HandshakeRequest,
        sink: Weak<dyn TransportEventSink>,
        timeout: Duration,
    ) -> Result<EstablishedTransport> {
        tokio::time::timeout(timeout, self.establish(address, request, sink))
            .await
            .map_err(|_| CommsError::timeout(format!("connect to {address}"), timeout.as_millis() as u64))?
    }
}
