//! Network Listener
//!
//! Accepts TCP connections, runs the server side of the transport
//! handshake and wires each admitted connection into a server channel of
//! its [`ChannelManager`]. Admission, in order:
//!
//! 1. the client stack version must match
//! 2. the optional validator may reject the presented identity
//! 3. a reconnecting client is reattached to its open channel, or gets a
//!    recreated channel when its id was seeded at `start`, and is refused
//!    otherwise; the presented process id must match the channel's
//! 4. the connection policy may refuse on capacity

use super::policy::{ConnectionIdFactory, ConnectionPolicy};
use super::ListenerRegistry;
use crate::channel::{ChannelManager, ChannelManagerEventListener, MessageChannel};
use crate::config::TcpConfig;
use crate::error::{CommsError, Result};
use crate::transport::tcp::{read_frame, write_frame};
use crate::transport::{TcpTransport, TransportEventSink};
use comms_codec::{HandshakeRequest, HandshakeResponse, HandshakeStatus, ProtocolError, WireFrame, STACK_VERSION};
use comms_types::{ChannelId, ConnectionId, ServerId};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepts or rejects a presented client identity
pub type ConnectionValidator = Arc<dyn Fn(&ConnectionId) -> bool + Send + Sync>;

pub struct NetworkListener {
    self_ref: Weak<NetworkListener>,
    requested: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    server_id: ServerId,
    channel_manager: Arc<ChannelManager>,
    id_factory: Arc<dyn ConnectionIdFactory>,
    policy: Arc<dyn ConnectionPolicy>,
    validator: Option<ConnectionValidator>,
    tcp: TcpConfig,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    reconnectable: Mutex<HashMap<ChannelId, ConnectionId>>,
    registry: Weak<ListenerRegistry>,
}

impl NetworkListener {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        requested: SocketAddr,
        server_id: ServerId,
        channel_manager: Arc<ChannelManager>,
        id_factory: Arc<dyn ConnectionIdFactory>,
        policy: Arc<dyn ConnectionPolicy>,
        validator: Option<ConnectionValidator>,
        tcp: TcpConfig,
        registry: Weak<ListenerRegistry>,
    ) -> Arc<Self> {
        channel_manager.add_event_listener(Arc::new(PolicyRelease {
            policy: Arc::clone(&policy),
        }));
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            requested,
            bound: Mutex::new(None),
            server_id,
            channel_manager,
            id_factory,
            policy,
            validator,
            tcp,
            accept_task: Mutex::new(None),
            reconnectable: Mutex::new(HashMap::new()),
            registry,
        })
    }

    /// Bind and start accepting
    ///
    /// Clients holding one of `initial_connection_ids` may reconnect even
    /// though this listener never created their channel. Returns the bound
    /// address, which differs from the requested one for port 0.
    pub async fn start(&self, initial_connection_ids: Vec<ConnectionId>) -> Result<SocketAddr> {
        if self.is_started() {
            return Err(CommsError::illegal_state("start", "listener already started"));
        }
        let socket = TcpListener::bind(self.requested)
            .await
            .map_err(|e| CommsError::io(format!("Failed to bind {}", self.requested), e))?;
        let local = socket
            .local_addr()
            .map_err(|e| CommsError::io("Failed to read bound address", e))?;

        self.id_factory.restore(&initial_connection_ids);
        self.reconnectable.lock().extend(
            initial_connection_ids
                .into_iter()
                .filter(ConnectionId::is_valid)
                .map(|id| (id.channel_id(), id)),
        );

        let task = tokio::spawn(Self::accept_loop(self.self_ref.clone(), socket));
        {
            let mut slot = self.accept_task.lock();
            if slot.is_some() {
                task.abort();
                return Err(CommsError::illegal_state("start", "listener already started"));
            }
            *slot = Some(task);
        }
        *self.bound.lock() = Some(local);

        if let (Some(registry), Some(me)) = (self.registry.upgrade(), self.self_ref.upgrade()) {
            registry.lock().push(me);
        }
        info!(addr = %local, server = %self.server_id, "Listener started");
        Ok(local)
    }

    /// Stop accepting; a listener that never started is left as is
    ///
    /// Existing channels stay open. Fails with a timeout error when the
    /// accept task does not finish within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let Some(task) = self.accept_task.lock().take() else {
            debug!(addr = %self.requested, "Listener not started; nothing to stop");
            return Ok(());
        };
        task.abort();
        if tokio::time::timeout(timeout, task).await.is_err() {
            return Err(CommsError::timeout("stop listener", timeout.as_millis() as u64));
        }
        let bound = self.bound.lock().take();

        if let Some(registry) = self.registry.upgrade() {
            registry.lock().retain(|listener| !std::ptr::eq(Arc::as_ptr(listener), self));
        }
        info!(addr = ?bound, "Listener stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.accept_task.lock().is_some()
    }

    /// Bound address while started
    pub fn bound_address(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.channel_manager
    }

    pub fn policy(&self) -> &Arc<dyn ConnectionPolicy> {
        &self.policy
    }

    pub fn state_map(&self) -> serde_json::Value {
        json!({
            "requested": self.requested.to_string(),
            "bound": self.bound_address().map(|a| a.to_string()),
            "server_id": self.server_id.to_string(),
            "channels": self.channel_manager.channel_count(),
            "connections": self.policy.connection_count(),
            "max_connections": self.policy.max_connections(),
        })
    }

    async fn accept_loop(listener: Weak<Self>, socket: TcpListener) {
        loop {
            let (stream, peer) = match socket.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };
            let Some(this) = listener.upgrade() else { break };
            tokio::spawn(async move {
                if let Err(e) = this.admit(stream, peer).await {
                    warn!(peer = %peer, error = %e, "Connection not admitted");
                }
            });
        }
    }

    async fn admit(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(e) = stream.set_nodelay(self.tcp.nodelay) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let timeout = self.tcp.handshake_timeout();
        let (frame, _) = tokio::time::timeout(timeout, read_frame(&mut stream, self.tcp.max_frame_size))
            .await
            .map_err(|_| CommsError::timeout(format!("handshake from {peer}"), timeout.as_millis() as u64))??;
        let request = match frame {
            WireFrame::Handshake(request) => request,
            other => {
                return Err(ProtocolError::invalid_field(
                    "handshake",
                    format!("expected handshake, got {:?}", other.kind()),
                )
                .into())
            }
        };

        let (channel, connection_id) = match self.decide(&request) {
            Ok(admitted) => admitted,
            Err(refusal) => {
                info!(peer = %peer, status = ?refusal.status, detail = %refusal.detail, "Refusing connection");
                return write_frame(&mut stream, &WireFrame::HandshakeAck(refusal)).await;
            }
        };

        let accepted = HandshakeResponse::accepted(connection_id.clone(), self.server_id.clone());
        if let Err(e) = write_frame(&mut stream, &WireFrame::HandshakeAck(accepted)).await {
            if !channel.is_connected() {
                channel.close();
            }
            return Err(e);
        }

        let sink: Weak<dyn TransportEventSink> = Arc::downgrade(&channel) as Weak<dyn TransportEventSink>;
        let transport = TcpTransport::new(stream, connection_id, sink, self.tcp.max_frame_size)?;
        channel.attach_transport(transport)?;
        debug!(peer = %peer, channel = %channel.channel_id(), "Connection admitted");
        Ok(())
    }

    fn decide(&self, request: &HandshakeRequest) -> std::result::Result<(Arc<MessageChannel>, ConnectionId), HandshakeResponse> {
        let refuse = |status: HandshakeStatus, detail: String| HandshakeResponse::refused(status, self.server_id.clone(), detail);

        if request.stack_version != STACK_VERSION {
            return Err(refuse(
                HandshakeStatus::StackMismatch,
                format!("client stack {} does not match server stack {}", request.stack_version, STACK_VERSION),
            ));
        }
        if let Some(validator) = &self.validator {
            if !validator(&request.connection_id) {
                return Err(refuse(HandshakeStatus::Rejected, "connection rejected".to_string()));
            }
        }

        if request.is_reconnect() {
            let presented = &request.connection_id;
            let id = presented.channel_id();
            let wrong_owner = |owner: &ConnectionId| {
                debug!(channel = %id, owner = owner.jvm_id(), presented = presented.jvm_id(), "Reconnect from another process");
                refuse(
                    HandshakeStatus::ReconnectionRejected,
                    format!("channel {id} belongs to another process"),
                )
            };
            if let Some(channel) = self.channel_manager.get_channel(id) {
                if channel.is_open() {
                    let connection_id = channel.connection_id();
                    if connection_id.jvm_id() != presented.jvm_id() {
                        return Err(wrong_owner(&connection_id));
                    }
                    return Ok((channel, connection_id));
                }
            }
            let seeded = self.reconnectable.lock().remove(&id);
            return match seeded {
                None => Err(refuse(
                    HandshakeStatus::ReconnectionRejected,
                    format!("channel {id} is unknown to {}", self.server_id),
                )),
                Some(seeded) if seeded.jvm_id() != presented.jvm_id() => {
                    let refusal = wrong_owner(&seeded);
                    self.reconnectable.lock().insert(id, seeded);
                    Err(refusal)
                }
                Some(seeded) => self.register(seeded, &refuse),
            };
        }

        let Some(connection_id) = self.id_factory.next_connection_id(&request.connection_id) else {
            return Err(refuse(HandshakeStatus::Rejected, "no channel ids left".to_string()));
        };
        self.register(connection_id, &refuse)
    }

    fn register(
        &self,
        connection_id: ConnectionId,
        refuse: &dyn Fn(HandshakeStatus, String) -> HandshakeResponse,
    ) -> std::result::Result<(Arc<MessageChannel>, ConnectionId), HandshakeResponse> {
        if !self.policy.connect(&connection_id) {
            let limit = self.policy.max_connections().unwrap_or_default();
            return Err(refuse(
                HandshakeStatus::MaxConnectionsExceeded,
                format!("limit of {limit} client connections reached"),
            ));
        }
        match self.channel_manager.create_new_channel(&connection_id) {
            Ok(channel) => Ok((channel, connection_id)),
            Err(e) => {
                self.policy.disconnect(&connection_id);
                Err(refuse(HandshakeStatus::Rejected, e.to_string()))
            }
        }
    }
}

impl fmt::Debug for NetworkListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkListener")
            .field("requested", &self.requested)
            .field("bound", &self.bound_address())
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// Returns a removed channel's slot to the policy
struct PolicyRelease {
    policy: Arc<dyn ConnectionPolicy>,
}

impl ChannelManagerEventListener for PolicyRelease {
    fn channel_created(&self, _channel: &Arc<MessageChannel>) {}

    fn channel_removed(&self, channel: &Arc<MessageChannel>) {
        self.policy.disconnect(&channel.connection_id());
    }
}
