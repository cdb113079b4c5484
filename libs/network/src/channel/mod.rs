//! Message Channels
//!
//! A [`MessageChannel`] is one logical duplex message stream to a remote
//! node. It owns the status, attachments and listeners; bytes go through
//! whichever [`Transport`] is currently attached, and the transport may be
//! replaced across reconnects without the channel changing identity.
//!
//! One concrete type serves both ends. [`ChannelRole::Client`] channels are
//! created `Init`, opened explicitly and can reconnect or `reset()`.
//! [`ChannelRole::Server`] channels are born `Open` from an accepted
//! handshake and receive new transports from their listener.
//!
//! ## Locking
//!
//! The status lock is taken before the transport lock and neither is held
//! while events fire, while a transport is closed, or across `.await`.

mod client;
pub mod event;
pub mod manager;

pub use client::ClientChannelConfig;
pub use event::{ChannelEvent, ChannelEventListener, ChannelEventType, ChannelStatus};
pub use manager::{
    ChannelFactory, ChannelManager, ChannelManagerEventListener, DisconnectPredicate, ServerChannelFactory,
};

use crate::error::{CommsError, Result, RoutingError};
use crate::message::{MessageFactory, MessageMonitor, MessageParser, MessageRouter, TcMessage};
use crate::session::{DefaultSessionProvider, SessionProvider};
use crate::transport::{ConnectionHealthChecker, Transport, TransportEvent, TransportEventSink};
use bytes::Bytes;
use client::ClientState;
use comms_codec::WireFrame;
use comms_types::{ChannelId, ConnectionId, MessageType, NodeId, ProductId, ServerId, SessionId};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn, Level};

/// Collaborators shared by every channel of one client connection or listener
#[derive(Clone)]
pub struct ChannelParts {
    pub factory: Arc<MessageFactory>,
    pub router: Arc<MessageRouter>,
    pub monitor: Arc<dyn MessageMonitor>,
    pub health: Option<Arc<ConnectionHealthChecker>>,
}

pub(crate) enum ChannelRole {
    Client(ClientState),
    Server,
}

type Attachment = Arc<dyn Any + Send + Sync>;

pub struct MessageChannel {
    self_ref: Weak<MessageChannel>,
    role: ChannelRole,
    status: Mutex<ChannelStatus>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    connection_id: RwLock<ConnectionId>,
    local_node: RwLock<NodeId>,
    remote_node: RwLock<NodeId>,
    sessions: Arc<dyn SessionProvider>,
    attachments: Mutex<HashMap<String, Attachment>>,
    listeners: RwLock<Arc<Vec<Arc<dyn ChannelEventListener>>>>,
    factory: Arc<MessageFactory>,
    parser: MessageParser,
    router: Arc<MessageRouter>,
    monitor: Arc<dyn MessageMonitor>,
    health: Option<Arc<ConnectionHealthChecker>>,
}

impl MessageChannel {
    fn build(
        parts: ChannelParts,
        role: ChannelRole,
        status: ChannelStatus,
        connection_id: ConnectionId,
        local_node: NodeId,
        remote_node: NodeId,
        sessions: Arc<dyn SessionProvider>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            role,
            status: Mutex::new(status),
            transport: RwLock::new(None),
            connection_id: RwLock::new(connection_id),
            local_node: RwLock::new(local_node),
            remote_node: RwLock::new(remote_node),
            sessions,
            attachments: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Arc::new(Vec::new())),
            parser: MessageParser::new(Arc::clone(&parts.factory)),
            factory: parts.factory,
            router: parts.router,
            monitor: parts.monitor,
            health: parts.health,
        })
    }

    /// Unopened client channel
    pub(crate) fn new_client(
        parts: ChannelParts,
        config: ClientChannelConfig,
        sessions: Arc<dyn SessionProvider>,
    ) -> Arc<Self> {
        Self::build(
            parts,
            ChannelRole::Client(ClientState::new(config)),
            ChannelStatus::Init,
            ConnectionId::null(),
            NodeId::NULL_CLIENT,
            NodeId::Server(ServerId::null()),
            sessions,
        )
    }

    /// Open server channel for an admitted connection
    pub(crate) fn new_server(parts: ChannelParts, connection_id: ConnectionId, server_id: ServerId) -> Arc<Self> {
        let remote = NodeId::Client(connection_id.client_id());
        Self::build(
            parts,
            ChannelRole::Server,
            ChannelStatus::Open,
            connection_id,
            NodeId::Server(server_id),
            remote,
            Arc::new(DefaultSessionProvider::new()),
        )
    }

    pub fn channel_id(&self) -> ChannelId {
        self.connection_id.read().channel_id()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id.read().clone()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node.read().clone()
    }

    pub fn remote_node_id(&self) -> NodeId {
        self.remote_node.read().clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.sessions.current_session()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    pub fn is_open(&self) -> bool {
        self.status().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status().is_closed()
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, ChannelRole::Client(_))
    }

    /// Whether a transport is attached and connected
    pub fn is_connected(&self) -> bool {
        self.transport.read().as_ref().is_some_and(|t| t.is_connected())
    }

    pub fn product_id(&self) -> ProductId {
        match &self.role {
            ChannelRole::Client(client) => client.product(),
            ChannelRole::Server => self.connection_id.read().product(),
        }
    }

    pub fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// New outbound message bound to this channel
    pub fn create_message(&self, message_type: MessageType) -> Result<TcMessage> {
        let channel = self.strong("create_message")?;
        self.factory.create_message(&channel, message_type)
    }

    /// Queue `message` on the current transport
    ///
    /// Does not wait for the network. Messages sent from one task leave in
    /// call order.
    pub fn send(&self, message: TcMessage) -> Result<()> {
        match self.status() {
            ChannelStatus::Open => {}
            ChannelStatus::Init => {
                return Err(CommsError::illegal_state("send", format!("channel {} is not open", self.channel_id())))
            }
            ChannelStatus::Closed => return Err(CommsError::channel_closed(self.channel_id())),
        }
        let transport = self
            .current_transport()
            .ok_or_else(|| CommsError::channel_closed(self.channel_id()))?;

        let message_type = message.message_type();
        let bytes = message.encode()?;
        let size = bytes.len();
        transport.send_frame(WireFrame::Message(bytes))?;
        self.monitor.new_outgoing_message(message_type, size);

        if tracing::enabled!(Level::TRACE) {
            trace!(
                channel = %self.channel_id(),
                message_type = %message_type,
                bytes = size,
                session = %message.session_id(),
                "Message sent"
            );
        }
        Ok(())
    }

    /// Parse and route one inbound message frame
    ///
    /// Never fails outward: parse errors, fatal routing errors and sink
    /// panics are logged and close this channel. A sink declining a message
    /// only logs.
    pub fn receive(&self, frame: Bytes) {
        let Some(channel) = self.self_ref.upgrade() else { return };
        if self.is_closed() {
            debug!(channel = %self.channel_id(), "Dropping message received on closed channel");
            return;
        }
        let size = frame.len();
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let message = self.parser.parse_message(&channel, frame)?;
            self.monitor.new_incoming_message(message.message_type(), size);
            self.router.put_message(message)?;
            Ok(())
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(CommsError::Routing(RoutingError::Unsupported(message_type)))) => {
                warn!(channel = %self.channel_id(), message_type = %message_type, "Message declined by sink");
            }
            Ok(Err(e)) => {
                error!(
                    channel = %self.channel_id(),
                    error = %e,
                    category = e.category(),
                    "Failed to handle inbound message; closing channel"
                );
                self.close();
            }
            Err(_) => {
                error!(channel = %self.channel_id(), "Message sink panicked; closing channel");
                self.close();
            }
        }
    }

    /// Close the channel and its transport
    ///
    /// Returns `true` for the caller that performed the close; every later
    /// call is a no-op returning `false`. Valid from `Init`.
    pub fn close(&self) -> bool {
        {
            let mut status = self.status.lock();
            if status.is_closed() {
                debug!(channel = %self.channel_id(), "Channel already closed");
                return false;
            }
            *status = ChannelStatus::Closed;
        }
        if let ChannelRole::Client(client) = &self.role {
            client.cancel_reconnect();
        }
        if let Some(transport) = self.current_transport() {
            transport.close();
        }
        debug!(channel = %self.channel_id(), "Channel closed");
        self.fire(ChannelEventType::Closed);
        true
    }

    /// Store `value` under `key`
    ///
    /// With `replace == false` an existing value wins. Returns whether
    /// `value` was stored.
    pub fn add_attachment<T>(&self, key: impl Into<String>, value: T, replace: bool) -> bool
    where
        T: Any + Send + Sync,
    {
        let mut attachments = self.attachments.lock();
        let key = key.into();
        if !replace && attachments.contains_key(&key) {
            return false;
        }
        attachments.insert(key, Arc::new(value));
        true
    }

    /// Attachment under `key` if present and of type `T`
    pub fn get_attachment<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let attachment = self.attachments.lock().get(key).cloned()?;
        attachment.downcast::<T>().ok()
    }

    pub fn remove_attachment(&self, key: &str) -> bool {
        self.attachments.lock().remove(key).is_some()
    }

    /// Register a lifecycle listener for the life of the channel
    pub fn add_listener(&self, listener: Arc<dyn ChannelEventListener>) {
        let mut listeners = self.listeners.write();
        let mut next = Vec::with_capacity(listeners.len() + 1);
        next.extend(listeners.iter().cloned());
        next.push(listener);
        *listeners = Arc::new(next);
    }

    /// Server side: install a transport accepted for this channel
    ///
    /// A reconnecting client's new transport replaces the old one.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        if self.is_client() {
            return Err(CommsError::illegal_state(
                "attach_transport",
                "client channels connect their own transports",
            ));
        }
        let previous = {
            let status = self.status.lock();
            if status.is_closed() {
                drop(status);
                transport.close();
                return Err(CommsError::channel_closed(self.channel_id()));
            }
            self.transport.write().replace(Arc::clone(&transport))
        };
        if let Some(previous) = previous {
            previous.close();
        }
        self.start_transport(transport);
        Ok(())
    }

    pub fn state_map(&self) -> serde_json::Value {
        let transport = self.current_transport();
        let role = if self.is_client() { "client" } else { "server" };
        let mut state = json!({
            "channel_id": self.channel_id().to_long(),
            "role": role,
            "status": self.status(),
            "product": self.product_id(),
            "local_node": self.local_node_id().to_string(),
            "remote_node": self.remote_node_id().to_string(),
            "session": self.session_id().to_long(),
            "connected": transport.as_ref().is_some_and(|t| t.is_connected()),
            "attachments": self.attachments.lock().len(),
            "listeners": self.listeners.read().len(),
        });
        if let Some(transport) = transport {
            state["remote_addr"] = json!(transport.remote_addr().to_string());
            state["transport"] = json!(transport.stats());
        }
        if let ChannelRole::Client(client) = &self.role {
            state["connect_count"] = json!(client.connect_count());
            state["connect_attempt_count"] = json!(client.connect_attempt_count());
        }
        state
    }

    /// New session, start the transport, register it for health checks
    fn start_transport(&self, transport: Arc<dyn Transport>) {
        let session = self.sessions.next_session();
        debug!(
            channel = %self.channel_id(),
            transport = transport.id(),
            peer = %transport.remote_addr(),
            session = %session,
            "Transport attached"
        );
        Arc::clone(&transport).start();
        if let Some(health) = &self.health {
            health.monitor(&transport);
        }
        self.fire(ChannelEventType::TransportConnected);
    }

    fn strong(&self, operation: &'static str) -> Result<Arc<MessageChannel>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| CommsError::illegal_state(operation, "channel is being dropped"))
    }

    fn fire(&self, event_type: ChannelEventType) {
        let Some(channel) = self.self_ref.upgrade() else { return };
        let listeners = Arc::clone(&self.listeners.read());
        let event = ChannelEvent::new(event_type, channel);
        for listener in listeners.iter() {
            listener.notify(&event);
        }
    }

    fn handle_disconnect(&self) {
        if let ChannelRole::Client(client) = &self.role {
            self.sessions.next_session();
            self.fire(ChannelEventType::TransportDisconnected);
            if self.is_open() && client.reconnect_enabled() {
                self.schedule_reconnect(client);
            }
        } else {
            self.fire(ChannelEventType::TransportDisconnected);
        }
    }
}

impl TransportEventSink for MessageChannel {
    fn on_message(&self, _transport_id: u64, frame: Bytes) {
        self.receive(frame);
    }

    fn on_transport_event(&self, transport_id: u64, event: TransportEvent) {
        let current = self.transport.read().as_ref().map(|t| t.id());
        if current != Some(transport_id) {
            debug!(channel = %self.channel_id(), transport = transport_id, ?event, "Ignoring event from replaced transport");
            return;
        }
        match event {
            TransportEvent::Disconnected => {
                debug!(channel = %self.channel_id(), transport = transport_id, "Transport disconnected");
                self.handle_disconnect();
            }
            TransportEvent::Closed => {
                self.fire(ChannelEventType::TransportClosed);
                self.close();
            }
        }
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("id", &self.channel_id())
            .field("client", &self.is_client())
            .field("status", &self.status())
            .field("local", &self.local_node_id())
            .field("remote", &self.remote_node_id())
            .finish()
    }
}
