//! Transport Layer
//!
//! A transport is one live, handshaken connection under a channel. Channels
//! outlive transports: a client channel swaps in a new transport when it
//! reconnects and a server channel receives one from its listener.
//!
//! Transports report back through a [`TransportEventSink`] held weakly, so a
//! dropped channel never stays alive through its socket tasks. Each
//! transport fires exactly one terminal event: `Closed` when either side
//! closed deliberately, `Disconnected` when the connection was lost.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use comms_codec::{HandshakeRequest, WireFrame};
use comms_types::{ConnectionId, ServerId};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub mod health;
pub mod tcp;

pub use health::ConnectionHealthChecker;
pub use tcp::{TcpConnector, TcpTransport};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transport id, used to discard events from replaced transports
pub(crate) fn next_transport_id() -> u64 {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Terminal transport notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection lost without a goodbye
    Disconnected,
    /// Closed deliberately, locally or by the peer
    Closed,
}

/// Receiver of a transport's inbound traffic and lifecycle events
pub trait TransportEventSink: Send + Sync {
    /// A complete message frame (header plus body)
    fn on_message(&self, transport_id: u64, frame: Bytes);

    fn on_transport_event(&self, transport_id: u64, event: TransportEvent);
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A connected, handshaken duplex frame stream
pub trait Transport: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;

    /// Begin delivering inbound frames and writing queued outbound ones
    fn start(self: Arc<Self>);

    /// Queue a frame for writing; returns the encoded size
    fn send_frame(&self, frame: WireFrame) -> Result<usize>;

    /// Say goodbye and shut down; idempotent
    fn close(&self);

    /// Abandon the connection without a goodbye, as if the link failed
    fn drop_connection(&self);

    fn is_connected(&self) -> bool;

    fn connection_id(&self) -> ConnectionId;

    fn remote_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;

    /// Time since the last inbound frame
    fn idle_for(&self) -> Duration;

    /// Health probes sent since the last inbound frame
    fn outstanding_probes(&self) -> u32;

    /// Send one health probe
    fn send_probe(&self) -> Result<()>;

    fn stats(&self) -> TransportStats;
}

/// Where a client connects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionAddress {
    pub host: String,
    pub port: u16,
}

impl ConnectionAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for ConnectionAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of a successful client connect
#[derive(Debug)]
pub struct EstablishedTransport {
    pub transport: Arc<dyn Transport>,
    pub server_id: ServerId,
}

/// Client-side transport construction: connect, handshake, wrap
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect to `address` and complete the transport handshake within `timeout`
    ///
    /// Handshake refusals map onto the matching error variants
    /// (`MaxConnectionsExceeded`, `StackMismatch`, `ReconnectionRejected`,
    /// `Rejected`). The returned transport is not started.
    async fn connect(
        &self,
        address: &ConnectionAddress,
        request: HandshakeRequest,
        sink: Weak<dyn TransportEventSink>,
        timeout: Duration,
    ) -> Result<EstablishedTransport>;
}
