//! Client channel behaviour: open, reopen, reset and automatic reconnect

use super::{ChannelEventType, ChannelRole, ChannelStatus, MessageChannel};
use crate::config::ReconnectConfig;
use crate::error::{CommsError, Result};
use crate::message::{ClientHandshakeMessage, TcMessage};
use crate::transport::{ConnectionAddress, EstablishedTransport, TransportConnector, TransportEventSink};
use comms_codec::{HandshakeRequest, STACK_VERSION};
use comms_types::{ConnectionId, Credentials, MessageType, NodeId, ProductId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed settings of one client channel
#[derive(Clone)]
pub struct ClientChannelConfig {
    pub product: ProductId,
    /// Client name sent in the handshake message
    pub name: String,
    /// Process identity presented to the server
    pub jvm_id: String,
    pub connector: Arc<dyn TransportConnector>,
    /// Bound on each connect plus handshake
    pub timeout: Duration,
    pub reconnect: ReconnectConfig,
}

pub(crate) struct ClientState {
    config: ClientChannelConfig,
    client_uuid: Uuid,
    addresses: RwLock<Vec<ConnectionAddress>>,
    credentials: RwLock<Option<Credentials>>,
    open_lock: tokio::sync::Mutex<()>,
    connect_count: AtomicU32,
    connect_attempt_count: AtomicU32,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientState {
    pub(crate) fn new(config: ClientChannelConfig) -> Self {
        Self {
            config,
            client_uuid: Uuid::new_v4(),
            addresses: RwLock::new(Vec::new()),
            credentials: RwLock::new(None),
            open_lock: tokio::sync::Mutex::new(()),
            connect_count: AtomicU32::new(0),
            connect_attempt_count: AtomicU32::new(0),
            reconnect_task: Mutex::new(None),
        }
    }

    pub(crate) fn product(&self) -> ProductId {
        self.config.product
    }

    pub(crate) fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Acquire)
    }

    pub(crate) fn connect_attempt_count(&self) -> u32 {
        self.connect_attempt_count.load(Ordering::Acquire)
    }

    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.config.reconnect.enabled && self.config.product.is_reconnect_enabled()
    }

    pub(crate) fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    /// Identity presented in the transport handshake
    fn presented_id(&self, previous: Option<ConnectionId>) -> ConnectionId {
        let id = previous.unwrap_or_else(|| ConnectionId::new(-1, self.config.jvm_id.clone(), "", self.config.product));
        match self.credentials.read().clone() {
            Some(credentials) => id.with_credentials(credentials),
            None => id,
        }
    }
}

impl MessageChannel {
    fn client(&self, operation: &'static str) -> Result<&ClientState> {
        match &self.role {
            ChannelRole::Client(client) => Ok(client),
            ChannelRole::Server => Err(CommsError::illegal_state(operation, "not supported on server channels")),
        }
    }

    /// Connect to the first reachable address and move to `Open`
    ///
    /// Only valid from `Init`. Each failed address is logged and the next
    /// one tried; the last error is returned when none succeeds. A close
    /// racing the connect wins and the new transport is shut down.
    pub async fn open(&self, addresses: &[ConnectionAddress]) -> Result<ConnectionId> {
        self.open_inner(addresses, None).await
    }

    pub async fn open_with_credentials(
        &self,
        addresses: &[ConnectionAddress],
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<ConnectionId> {
        let credentials = Credentials {
            username: username.into(),
            password: password.into(),
        };
        self.open_inner(addresses, Some(credentials)).await
    }

    async fn open_inner(&self, addresses: &[ConnectionAddress], credentials: Option<Credentials>) -> Result<ConnectionId> {
        let client = self.client("open")?;
        let _guard = client.open_lock.lock().await;
        let status = self.status();
        if status != ChannelStatus::Init {
            return Err(CommsError::illegal_state("open", format!("channel is {status}")));
        }
        *client.credentials.write() = credentials;
        *client.addresses.write() = addresses.to_vec();

        let established = self.connect_any(client, addresses, client.presented_id(None)).await?;
        self.install(client, established, ChannelStatus::Init)?;
        info!(channel = %self.channel_id(), remote = %self.remote_node_id(), "Channel opened");
        self.fire(ChannelEventType::Opened);
        Ok(self.connection_id())
    }

    /// Reconnect an open channel whose transport has gone away
    ///
    /// Presents the previous connection id so the server can reattach the
    /// same channel. A server refusal fires
    /// [`ChannelEventType::TransportReconnectionRejected`] and closes the
    /// channel.
    pub async fn reopen(&self) -> Result<ConnectionId> {
        let client = self.client("reopen")?;
        let _guard = client.open_lock.lock().await;
        let status = self.status();
        if status != ChannelStatus::Open {
            return Err(CommsError::illegal_state("reopen", format!("channel is {status}")));
        }
        if self.is_connected() {
            return Ok(self.connection_id());
        }
        let previous = self.connection_id();
        if previous.is_null() {
            return Err(CommsError::illegal_state("reopen", "channel was never connected"));
        }
        let addresses = client.addresses.read().clone();

        match self.connect_any(client, &addresses, client.presented_id(Some(previous))).await {
            Ok(established) => {
                self.install(client, established, ChannelStatus::Open)?;
                info!(channel = %self.channel_id(), session = %self.session_id(), "Channel reconnected");
                Ok(self.connection_id())
            }
            Err(e @ CommsError::ReconnectionRejected { .. }) => {
                warn!(channel = %self.channel_id(), error = %e, "Server rejected reconnect; closing channel");
                self.fire(ChannelEventType::TransportReconnectionRejected);
                self.close();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Return a closed client channel to `Init` so it can be opened again
    ///
    /// Listeners and attachments survive.
    pub fn reset(&self) -> Result<()> {
        self.client("reset")?;
        let previous = {
            let mut status = self.status.lock();
            if !status.is_closed() {
                return Err(CommsError::illegal_state("reset", format!("channel is {}", *status)));
            }
            *status = ChannelStatus::Init;
            self.transport.write().take()
        };
        drop(previous);
        debug!(channel = %self.channel_id(), "Channel reset");
        Ok(())
    }

    /// Client handshake message for the current connection
    pub fn create_handshake_message(&self) -> Result<TcMessage> {
        let client = self.client("create_handshake_message")?;
        let mut message = self.create_message(MessageType::ClientHandshake)?;
        if let Some(handshake) = message.payload_mut::<ClientHandshakeMessage>() {
            handshake.client_version = env!("CARGO_PKG_VERSION").to_string();
            handshake.client_uuid = client.client_uuid;
            handshake.pid = std::process::id();
            handshake.name = client.config.name.clone();
        }
        Ok(message)
    }

    /// Successful transport connects; 0 for server channels
    pub fn connect_count(&self) -> u32 {
        self.client("connect_count").map(ClientState::connect_count).unwrap_or(0)
    }

    /// Transport connect attempts, successful or not; 0 for server channels
    pub fn connect_attempt_count(&self) -> u32 {
        self.client("connect_attempt_count")
            .map(ClientState::connect_attempt_count)
            .unwrap_or(0)
    }

    async fn connect_any(
        &self,
        client: &ClientState,
        addresses: &[ConnectionAddress],
        presented: ConnectionId,
    ) -> Result<EstablishedTransport> {
        let sink: Weak<dyn TransportEventSink> = self.self_ref.clone();
        let mut last_error = None;
        for address in addresses {
            client.connect_attempt_count.fetch_add(1, Ordering::AcqRel);
            self.fire(ChannelEventType::TransportConnectAttempt);
            let request = HandshakeRequest {
                stack_version: STACK_VERSION,
                connection_id: presented.clone(),
                client_uuid: client.client_uuid,
            };
            match client
                .config
                .connector
                .connect(address, request, sink.clone(), client.config.timeout)
                .await
            {
                Ok(established) => return Ok(established),
                Err(e @ CommsError::ReconnectionRejected { .. }) => return Err(e),
                Err(e) => {
                    warn!(address = %address, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CommsError::configuration("no addresses to connect to", Some("addresses"))))
    }

    /// Adopt a connected transport if the status is still `expected`
    fn install(&self, client: &ClientState, established: EstablishedTransport, expected: ChannelStatus) -> Result<()> {
        let EstablishedTransport { transport, server_id } = established;
        let previous = {
            let mut status = self.status.lock();
            if *status != expected {
                let current = *status;
                drop(status);
                transport.close();
                return Err(match current {
                    ChannelStatus::Closed => CommsError::channel_closed(self.channel_id()),
                    other => CommsError::illegal_state("open", format!("channel became {other} while connecting")),
                });
            }
            let connection_id = transport.connection_id();
            *self.local_node.write() = NodeId::Client(connection_id.client_id());
            *self.remote_node.write() = NodeId::Server(server_id);
            *self.connection_id.write() = connection_id;
            *status = ChannelStatus::Open;
            self.transport.write().replace(Arc::clone(&transport))
        };
        if let Some(previous) = previous {
            previous.close();
        }
        client.connect_count.fetch_add(1, Ordering::AcqRel);
        self.start_transport(transport);
        Ok(())
    }

    pub(super) fn schedule_reconnect(&self, client: &ClientState) {
        let mut slot = client.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %self.channel_id(), "No tokio runtime; automatic reconnect disabled");
            return;
        };
        let channel = self.self_ref.clone();
        let policy = client.config.reconnect.clone();
        let id = self.channel_id();
        *slot = Some(runtime.spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if policy.max_attempts > 0 && attempt > policy.max_attempts {
                    warn!(channel = %id, attempts = policy.max_attempts, "Giving up reconnecting; closing channel");
                    if let Some(channel) = channel.upgrade() {
                        channel.close();
                    }
                    return;
                }
                tokio::time::sleep(policy.interval()).await;
                let Some(channel) = channel.upgrade() else { return };
                if !channel.is_open() {
                    return;
                }
                match channel.reopen().await {
                    Ok(_) => return,
                    Err(e) if e.is_recoverable() => {
                        debug!(channel = %id, attempt, error = %e, "Reconnect attempt failed");
                    }
                    Err(e) => {
                        warn!(channel = %id, error = %e, "Reconnect abandoned");
                        return;
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelParts;
    use crate::message::{handshake::builtin_mappings, MessageFactory, MessageRouter, NullMessageMonitor};
    use crate::session::DefaultSessionProvider;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl TransportConnector for Unreachable {
        async fn connect(
            &self,
            address: &ConnectionAddress,
            _request: HandshakeRequest,
            _sink: Weak<dyn TransportEventSink>,
            _timeout: Duration,
        ) -> Result<EstablishedTransport> {
            Err(CommsError::unknown_host(address.host.clone(), None))
        }
    }

    fn client_channel() -> Arc<MessageChannel> {
        let parts = ChannelParts {
            factory: Arc::new(MessageFactory::with_mappings(builtin_mappings())),
            router: Arc::new(MessageRouter::new()),
            monitor: Arc::new(NullMessageMonitor),
            health: None,
        };
        let config = ClientChannelConfig {
            product: ProductId::Stripe,
            name: "unit".into(),
            jvm_id: "jvm-unit".into(),
            connector: Arc::new(Unreachable),
            timeout: Duration::from_millis(50),
            reconnect: ReconnectConfig::default(),
        };
        MessageChannel::new_client(parts, config, Arc::new(DefaultSessionProvider::new()))
    }

    #[tokio::test]
    async fn test_failed_open_counts_every_address() {
        let channel = client_channel();
        let addresses = [ConnectionAddress::new("alpha.invalid", 1), ConnectionAddress::new("beta.invalid", 2)];
        let err = channel.open(&addresses).await.unwrap_err();
        assert!(matches!(err, CommsError::UnknownHost { ref host, .. } if host == "beta.invalid"));
        assert_eq!(channel.connect_attempt_count(), 2);
        assert_eq!(channel.connect_count(), 0);
        assert_eq!(channel.status(), ChannelStatus::Init);
    }

    #[tokio::test]
    async fn test_open_without_addresses_is_configuration_error() {
        let channel = client_channel();
        assert!(matches!(channel.open(&[]).await, Err(CommsError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_open_after_close_requires_reset() {
        let channel = client_channel();
        assert!(channel.close());
        let err = channel.open(&[ConnectionAddress::new("localhost", 1)]).await.unwrap_err();
        assert!(matches!(err, CommsError::IllegalState { operation: "open", .. }));

        channel.reset().unwrap();
        assert_eq!(channel.status(), ChannelStatus::Init);
        assert!(channel.reset().is_err());
    }

    #[tokio::test]
    async fn test_reopen_requires_open_channel() {
        let channel = client_channel();
        assert!(matches!(channel.reopen().await, Err(CommsError::IllegalState { .. })));
    }

    #[test]
    fn test_handshake_message_identifies_client() {
        let channel = client_channel();
        let message = channel.create_handshake_message().unwrap();
        let handshake = message.payload::<ClientHandshakeMessage>().unwrap();
        assert_eq!(handshake.name, "unit");
        assert_eq!(handshake.pid, std::process::id());
        assert!(!handshake.client_uuid.is_nil());
    }
}
