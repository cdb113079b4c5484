//! Channel Manager
//!
//! Live-channel registry of one listener. Channels are built by a
//! [`ChannelFactory`], registered under their [`ChannelId`] and removed when
//! they close. The manager follows each channel through a weak subscription,
//! so it never keeps a channel alive by listening to it.
//!
//! A channel kept open after its transport disconnects is closed when no new
//! transport arrives within the reconnect window.

use super::{ChannelEvent, ChannelEventListener, ChannelEventType, ChannelParts, MessageChannel};
use crate::error::{CommsError, Result};
use comms_types::{ChannelId, ConnectionId, ServerId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds the channel for an admitted connection
pub trait ChannelFactory: Send + Sync {
    fn new_channel(&self, connection_id: &ConnectionId) -> Arc<MessageChannel>;
}

/// Builds open server channels sharing one set of [`ChannelParts`]
pub struct ServerChannelFactory {
    parts: ChannelParts,
    server_id: ServerId,
}

impl ServerChannelFactory {
    pub fn new(parts: ChannelParts, server_id: ServerId) -> Self {
        Self { parts, server_id }
    }
}

impl ChannelFactory for ServerChannelFactory {
    fn new_channel(&self, connection_id: &ConnectionId) -> Arc<MessageChannel> {
        MessageChannel::new_server(self.parts.clone(), connection_id.clone(), self.server_id.clone())
    }
}

/// Observer of registry membership
pub trait ChannelManagerEventListener: Send + Sync {
    /// A channel's transport connected; the channel is usable
    fn channel_created(&self, channel: &Arc<MessageChannel>);

    /// A closed channel left the registry
    fn channel_removed(&self, channel: &Arc<MessageChannel>);
}

/// Decides whether a transport disconnect closes the server channel
pub type DisconnectPredicate = Arc<dyn Fn(&Arc<MessageChannel>) -> bool + Send + Sync>;

/// Close on disconnect unless the client's product reconnects
pub fn close_unless_reconnect_enabled() -> DisconnectPredicate {
    Arc::new(|channel: &Arc<MessageChannel>| !channel.product_id().is_reconnect_enabled())
}

pub struct ChannelManager {
    self_ref: Weak<ChannelManager>,
    channels: Mutex<HashMap<ChannelId, Arc<MessageChannel>>>,
    factory: Arc<dyn ChannelFactory>,
    close_on_disconnect: DisconnectPredicate,
    reconnect_window: Option<Duration>,
    listeners: RwLock<Arc<Vec<Arc<dyn ChannelManagerEventListener>>>>,
}

impl ChannelManager {
    /// `reconnect_window` of `None` keeps disconnected channels until closed
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        close_on_disconnect: DisconnectPredicate,
        reconnect_window: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            channels: Mutex::new(HashMap::new()),
            factory,
            close_on_disconnect,
            reconnect_window,
            listeners: RwLock::new(Arc::new(Vec::new())),
        })
    }

    /// Build, subscribe to and register the channel for `connection_id`
    ///
    /// The channel is visible to lookups only once it is fully set up.
    pub fn create_new_channel(&self, connection_id: &ConnectionId) -> Result<Arc<MessageChannel>> {
        let channel_id = connection_id.channel_id();
        if channel_id.is_null() {
            return Err(CommsError::illegal_state("create_new_channel", "null channel id"));
        }

        let mut channels = self.channels.lock();
        if channels.contains_key(&channel_id) {
            return Err(CommsError::illegal_state(
                "create_new_channel",
                format!("channel {channel_id} already exists"),
            ));
        }
        let channel = self.factory.new_channel(connection_id);
        channel.add_listener(Arc::new(Subscription {
            manager: self.self_ref.clone(),
        }));
        channels.insert(channel_id, Arc::clone(&channel));
        debug!(channel = %channel_id, connection = %connection_id, "Channel registered");
        Ok(channel)
    }

    pub fn get_channel(&self, id: ChannelId) -> Option<Arc<MessageChannel>> {
        self.channels.lock().get(&id).cloned()
    }

    /// Snapshot of all registered channels
    pub fn get_channels(&self) -> Vec<Arc<MessageChannel>> {
        self.channels.lock().values().cloned().collect()
    }

    pub fn all_channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ChannelManagerEventListener>) {
        let mut listeners = self.listeners.write();
        let mut next = Vec::with_capacity(listeners.len() + 1);
        next.extend(listeners.iter().cloned());
        next.push(listener);
        *listeners = Arc::new(next);
    }

    /// Close every registered channel; returns how many were closed
    ///
    /// Closing removes synchronously, so the registry is empty on return
    /// unless channels were created concurrently.
    pub fn close_all_channels(&self) -> usize {
        let channels = self.get_channels();
        let closed = channels.iter().filter(|channel| channel.close()).count();
        let remaining = self.channel_count();
        if remaining > 0 {
            warn!(remaining, "Channels registered while closing all channels");
        }
        info!(closed, "Closed all channels");
        closed
    }

    fn remove_channel(&self, channel: &Arc<MessageChannel>) {
        let id = channel.channel_id();
        let removed = self.channels.lock().remove(&id);
        match removed {
            Some(removed) => {
                debug!(channel = %id, "Channel removed");
                self.fire(|listener| listener.channel_removed(&removed));
            }
            None => warn!(channel = %id, "Closed channel was not registered"),
        }
    }

    fn fire(&self, notify: impl Fn(&Arc<dyn ChannelManagerEventListener>)) {
        let listeners = Arc::clone(&self.listeners.read());
        for listener in listeners.iter() {
            notify(listener);
        }
    }

    fn on_channel_event(&self, event: &ChannelEvent) {
        let channel = event.channel();
        match event.event_type() {
            ChannelEventType::Closed => self.remove_channel(channel),
            ChannelEventType::TransportDisconnected => {
                if (self.close_on_disconnect)(channel) {
                    debug!(channel = %channel.channel_id(), "Closing channel after transport disconnect");
                    channel.close();
                } else {
                    debug!(channel = %channel.channel_id(), "Keeping channel open for reconnect");
                    if let Some(window) = self.reconnect_window {
                        expire_unless_reattached(channel, window);
                    }
                }
            }
            ChannelEventType::TransportConnected => self.fire(|listener| listener.channel_created(channel)),
            _ => {}
        }
    }
}

/// Close `channel` after `window` unless a transport was attached meanwhile
///
/// Every attach starts a new session, so an unchanged session id means the
/// client never came back.
fn expire_unless_reattached(channel: &Arc<MessageChannel>, window: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(channel = %channel.channel_id(), "No runtime for the reconnect window; channel stays open");
        return;
    };
    let session = channel.session_id();
    let channel = Arc::downgrade(channel);
    runtime.spawn(async move {
        tokio::time::sleep(window).await;
        let Some(channel) = channel.upgrade() else { return };
        if channel.is_open() && channel.session_id() == session {
            info!(
                channel = %channel.channel_id(),
                window_ms = window.as_millis() as u64,
                "Client did not reconnect in time; closing channel"
            );
            channel.close();
        }
    });
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.all_channel_ids())
            .finish()
    }
}

struct Subscription {
    manager: Weak<ChannelManager>,
}

impl ChannelEventListener for Subscription {
    fn notify(&self, event: &ChannelEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_channel_event(event);
        }
    }
}
