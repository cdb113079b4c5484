//! Communications Manager
//!
//! The facade a node is built around. One manager owns:
//!
//! - the message-type mappings, registered once and copied into every
//!   client channel and listener created afterwards
//! - the router and message monitor shared by all of its channels
//! - the connection health checker
//! - the listeners it started
//! - weak handles to the client channels it created, closed on shutdown
//!
//! Several managers can live in one process without seeing each other's
//! mappings.

pub mod listener;
pub mod policy;

pub use listener::{ConnectionValidator, NetworkListener};
pub use policy::{
    ConnectionIdFactory, ConnectionPolicy, DefaultConnectionIdFactory, MaxConnectionsPolicy, NullConnectionPolicy,
};

use crate::channel::manager::close_unless_reconnect_enabled;
use crate::channel::{
    ChannelManager, ChannelParts, ClientChannelConfig, DisconnectPredicate, MessageChannel, ServerChannelFactory,
};
use crate::config::CommsConfig;
use crate::error::{CommsError, Result};
use crate::message::handshake::builtin_mappings;
use crate::message::{MessageFactory, MessageMapping, MessageMonitor, MessageMonitorImpl, MessageRouter, NullMessageMonitor};
use crate::session::SessionProvider;
use crate::transport::{ConnectionHealthChecker, TcpConnector, TransportConnector};
use comms_types::{MessageType, ProductId, ServerId};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) type ListenerRegistry = Mutex<Vec<Arc<NetworkListener>>>;

/// Per-listener choices; every field falls back to a manager default
#[derive(Default, Clone)]
pub struct ListenerOptions {
    /// Whether a transport disconnect closes the server channel; defaults to
    /// closing unless the client's product reconnects
    pub close_on_disconnect: Option<DisconnectPredicate>,
    pub connection_id_factory: Option<Arc<dyn ConnectionIdFactory>>,
    pub policy: Option<Arc<dyn ConnectionPolicy>>,
    pub validator: Option<ConnectionValidator>,
}

pub struct CommunicationsManagerBuilder {
    config: CommsConfig,
    router: Option<Arc<MessageRouter>>,
    monitor: Option<Arc<dyn MessageMonitor>>,
    connector: Option<Arc<dyn TransportConnector>>,
    mappings: Vec<(MessageType, MessageMapping)>,
}

impl CommunicationsManagerBuilder {
    pub fn router(mut self, router: Arc<MessageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MessageMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Replace the TCP connector used by client channels
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn mapping(mut self, message_type: MessageType, mapping: MessageMapping) -> Self {
        self.mappings.push((message_type, mapping));
        self
    }

    pub fn build(self) -> Result<CommunicationsManager> {
        self.config.validate()?;

        let mappings = MessageFactory::with_mappings(builtin_mappings());
        for (message_type, mapping) in self.mappings {
            mappings.add_mapping(message_type, mapping)?;
        }

        let monitor: Arc<dyn MessageMonitor> = match self.monitor {
            Some(monitor) => monitor,
            None if self.config.monitor.enabled => {
                let monitor = Arc::new(MessageMonitorImpl::new());
                if let Some(interval) = self.config.monitor.log_interval() {
                    monitor.start_periodic_dump(interval);
                }
                monitor
            }
            None => Arc::new(NullMessageMonitor),
        };
        let health = self
            .config
            .health_check
            .enabled
            .then(|| ConnectionHealthChecker::new(self.config.health_check.clone()));
        let connector: Arc<dyn TransportConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(self.config.tcp.clone())),
        };

        info!(name = %self.config.name, health_check = health.is_some(), "Communications manager created");
        Ok(CommunicationsManager {
            jvm_id: format!("{}-{}", std::process::id(), Uuid::new_v4().simple()),
            router: self.router.unwrap_or_default(),
            config: self.config,
            mappings,
            monitor,
            health,
            connector,
            listeners: Arc::new(Mutex::new(Vec::new())),
            client_channels: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }
}

pub struct CommunicationsManager {
    config: CommsConfig,
    jvm_id: String,
    mappings: MessageFactory,
    router: Arc<MessageRouter>,
    monitor: Arc<dyn MessageMonitor>,
    health: Option<Arc<ConnectionHealthChecker>>,
    connector: Arc<dyn TransportConnector>,
    listeners: Arc<ListenerRegistry>,
    client_channels: Mutex<Vec<Weak<MessageChannel>>>,
    shutdown: AtomicBool,
}

impl CommunicationsManager {
    pub fn builder(config: CommsConfig) -> CommunicationsManagerBuilder {
        CommunicationsManagerBuilder {
            config,
            router: None,
            monitor: None,
            connector: None,
            mappings: Vec::new(),
        }
    }

    pub fn new(config: CommsConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Register the mapping for `message_type`; a second registration fails
    pub fn add_class_mapping(&self, message_type: MessageType, mapping: MessageMapping) -> Result<()> {
        self.mappings.add_mapping(message_type, mapping)
    }

    /// Unopened client channel
    ///
    /// `timeout` bounds each connect plus handshake during `open` and
    /// `reopen`.
    pub fn create_client_channel(
        &self,
        product: ProductId,
        session_provider: Arc<dyn SessionProvider>,
        timeout: Duration,
    ) -> Result<Arc<MessageChannel>> {
        self.ensure_running("create_client_channel")?;
        let config = ClientChannelConfig {
            product,
            name: self.config.name.clone(),
            jvm_id: self.jvm_id.clone(),
            connector: Arc::clone(&self.connector),
            timeout,
            reconnect: self.config.reconnect.clone(),
        };
        let channel = MessageChannel::new_client(self.channel_parts(), config, session_provider);
        let mut clients = self.client_channels.lock();
        clients.retain(|client| client.strong_count() > 0);
        clients.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    /// Listener for `address` with its own channel manager; not yet bound
    pub fn create_listener(&self, address: SocketAddr, options: ListenerOptions) -> Result<Arc<NetworkListener>> {
        self.ensure_running("create_listener")?;
        let server_id = ServerId::generate(self.config.name.clone());
        let factory = ServerChannelFactory::new(self.channel_parts(), server_id.clone());
        let channel_manager = ChannelManager::new(
            Arc::new(factory),
            options.close_on_disconnect.unwrap_or_else(close_unless_reconnect_enabled),
            self.config.listener.reconnect_window(),
        );
        let id_factory: Arc<dyn ConnectionIdFactory> = match options.connection_id_factory {
            Some(factory) => factory,
            None => Arc::new(DefaultConnectionIdFactory::new(server_id.to_string())),
        };
        let policy: Arc<dyn ConnectionPolicy> = match (options.policy, self.config.max_connections) {
            (Some(policy), _) => policy,
            (None, Some(max)) => Arc::new(MaxConnectionsPolicy::new(max)),
            (None, None) => Arc::new(NullConnectionPolicy),
        };

        Ok(NetworkListener::new(
            address,
            server_id,
            channel_manager,
            id_factory,
            policy,
            options.validator,
            self.config.tcp.clone(),
            Arc::downgrade(&self.listeners),
        ))
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn monitor(&self) -> &Arc<dyn MessageMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub fn health_checker(&self) -> Option<&Arc<ConnectionHealthChecker>> {
        self.health.as_ref()
    }

    pub fn mapped_types(&self) -> Vec<MessageType> {
        self.mappings.mapped_types()
    }

    /// Listeners currently started
    pub fn all_listeners(&self) -> Vec<Arc<NetworkListener>> {
        self.listeners.lock().clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop health checking and every started listener, closing their
    /// channels and the client channels this manager created
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            warn!(name = %self.config.name, "Communications manager already shut down");
            return;
        }
        if let Some(health) = &self.health {
            health.stop();
        }
        let stop_timeout = self.config.listener.stop_timeout();
        let listeners = self.all_listeners();
        let stopped = join_all(listeners.iter().map(|listener| listener.stop(stop_timeout))).await;
        for (listener, result) in listeners.iter().zip(stopped) {
            if let Err(e) = result {
                warn!(server = %listener.server_id(), error = %e, "Failed to stop listener");
            }
            listener.channel_manager().close_all_channels();
        }
        let clients: Vec<Arc<MessageChannel>> = self
            .client_channels
            .lock()
            .drain(..)
            .filter_map(|client| client.upgrade())
            .collect();
        let closed = clients.iter().filter(|client| client.close()).count();
        if closed > 0 {
            info!(name = %self.config.name, closed, "Closed client channels");
        }
        self.monitor.shutdown();
        info!(name = %self.config.name, "Communications manager shut down");
    }

    pub fn state_map(&self) -> serde_json::Value {
        let listeners: Vec<serde_json::Value> = self.all_listeners().iter().map(|l| l.state_map()).collect();
        json!({
            "name": self.config.name,
            "shutdown": self.is_shutdown(),
            "mapped_types": self.mapped_types().iter().map(|t| t.name()).collect::<Vec<_>>(),
            "router": {
                "routed": self.router.stats().routed,
                "defaulted": self.router.stats().defaulted,
                "unrouted": self.router.stats().unrouted,
            },
            "health_check": self.health.as_ref().map(|h| h.monitored_count()),
            "client_channels": self.client_channels.lock().iter().filter(|c| c.strong_count() > 0).count(),
            "listeners": listeners,
        })
    }

    fn channel_parts(&self) -> ChannelParts {
        ChannelParts {
            factory: Arc::new(MessageFactory::with_mappings(self.mappings.snapshot())),
            router: Arc::clone(&self.router),
            monitor: Arc::clone(&self.monitor),
            health: self.health.clone(),
        }
    }

    fn ensure_running(&self, operation: &'static str) -> Result<()> {
        if self.is_shutdown() {
            warn!(operation, "Communications manager is shut down");
            return Err(CommsError::Shutdown);
        }
        Ok(())
    }
}

impl fmt::Debug for CommunicationsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicationsManager")
            .field("name", &self.config.name)
            .field("jvm_id", &self.jvm_id)
            .field("mapped_types", &self.mapped_types().len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PingMessage;

    #[test]
    fn test_builtin_handshake_mappings_present() {
        let manager = CommunicationsManager::new(CommsConfig::default()).unwrap();
        let types = manager.mapped_types();
        assert!(types.contains(&MessageType::ClientHandshake));
        assert!(types.contains(&MessageType::ClientHandshakeAck));
        assert!(types.contains(&MessageType::ClientHandshakeRefused));
    }

    #[test]
    fn test_duplicate_class_mapping_is_configuration_error() {
        let manager = CommunicationsManager::new(CommsConfig::default()).unwrap();
        manager
            .add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap();
        let err = manager
            .add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap_err();
        assert!(matches!(err, CommsError::DuplicateMapping(MessageType::Ping)));

        let err = manager
            .add_class_mapping(MessageType::ClientHandshake, MessageMapping::of::<PingMessage>())
            .unwrap_err();
        assert!(matches!(err, CommsError::DuplicateMapping(MessageType::ClientHandshake)));
    }

    #[test]
    fn test_builder_rejects_duplicate_mappings() {
        let result = CommunicationsManager::builder(CommsConfig::default())
            .mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .build();
        assert!(matches!(result, Err(CommsError::DuplicateMapping(MessageType::Ping))));
    }

    #[test]
    fn test_managers_do_not_share_mappings() {
        let first = CommunicationsManager::new(CommsConfig::default()).unwrap();
        let second = CommunicationsManager::new(CommsConfig::default()).unwrap();
        first
            .add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap();
        assert!(!second.mapped_types().contains(&MessageType::Ping));
        second
            .add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap();
    }

    #[test]
    fn test_client_channels_see_mappings_registered_before_creation() {
        let manager = CommunicationsManager::new(CommsConfig::default()).unwrap();
        manager
            .add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap();
        let channel = manager
            .create_client_channel(
                ProductId::Stripe,
                Arc::new(crate::session::DefaultSessionProvider::new()),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(channel.create_message(MessageType::Ping).is_ok());
        assert!(matches!(
            channel.create_message(MessageType::Jmx),
            Err(CommsError::UnmappedMessageType { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_blocks_new_channels() {
        let mut config = CommsConfig::default();
        config.health_check.enabled = true;
        let manager = CommunicationsManager::new(config).unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert!(manager.is_shutdown());
        assert!(matches!(
            manager.create_listener(SocketAddr::from(([127, 0, 0, 1], 0)), ListenerOptions::default()),
            Err(CommsError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_client_channels() {
        let manager = CommunicationsManager::new(CommsConfig::default()).unwrap();
        let sessions = Arc::new(crate::session::DefaultSessionProvider::new());
        let kept = manager
            .create_client_channel(ProductId::Stripe, sessions.clone(), Duration::from_secs(1))
            .unwrap();
        let dropped = manager
            .create_client_channel(ProductId::Stripe, sessions, Duration::from_secs(1))
            .unwrap();
        drop(dropped);
        assert_eq!(manager.state_map()["client_channels"], 1);

        manager.shutdown().await;
        assert!(kept.is_closed());
        assert_eq!(manager.state_map()["client_channels"], 0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let manager = CommunicationsManager::new(CommsConfig::default()).unwrap();
        let listener = manager
            .create_listener(SocketAddr::from(([127, 0, 0, 1], 0)), ListenerOptions::default())
            .unwrap();
        listener.stop(Duration::from_millis(10)).await.unwrap();
        assert!(!listener.is_started());
        assert!(manager.all_listeners().is_empty());
    }
}
