//! Connection admission and connection-id allocation

use comms_types::{ChannelId, ConnectionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Admission control for a listener
pub trait ConnectionPolicy: Send + Sync {
    /// Record a new connection; `false` refuses it
    fn connect(&self, connection_id: &ConnectionId) -> bool;

    /// Forget a connection admitted earlier
    fn disconnect(&self, connection_id: &ConnectionId);

    fn is_max_reached(&self) -> bool;

    /// `None` when unlimited
    fn max_connections(&self) -> Option<usize>;

    /// Connections currently counted against the limit
    fn connection_count(&self) -> usize;
}

/// Admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConnectionPolicy;

impl ConnectionPolicy for NullConnectionPolicy {
    fn connect(&self, _connection_id: &ConnectionId) -> bool {
        true
    }

    fn disconnect(&self, _connection_id: &ConnectionId) {}

    fn is_max_reached(&self) -> bool {
        false
    }

    fn max_connections(&self) -> Option<usize> {
        None
    }

    fn connection_count(&self) -> usize {
        0
    }
}

/// Limits the number of distinct client processes
///
/// Several channels from one process count once. Internal products never
/// count.
pub struct MaxConnectionsPolicy {
    max: usize,
    clients: Mutex<HashMap<String, HashSet<ChannelId>>>,
}

impl MaxConnectionsPolicy {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl ConnectionPolicy for MaxConnectionsPolicy {
    fn connect(&self, connection_id: &ConnectionId) -> bool {
        if connection_id.product().is_internal() {
            return true;
        }
        let mut clients = self.clients.lock();
        if let Some(channels) = clients.get_mut(connection_id.jvm_id()) {
            channels.insert(connection_id.channel_id());
            return true;
        }
        if clients.len() >= self.max {
            info!(
                jvm = connection_id.jvm_id(),
                max = self.max,
                "Refusing connection; client limit reached"
            );
            return false;
        }
        clients.insert(
            connection_id.jvm_id().to_string(),
            HashSet::from([connection_id.channel_id()]),
        );
        true
    }

    fn disconnect(&self, connection_id: &ConnectionId) {
        let mut clients = self.clients.lock();
        let Some(channels) = clients.get_mut(connection_id.jvm_id()) else {
            return;
        };
        channels.remove(&connection_id.channel_id());
        if channels.is_empty() {
            clients.remove(connection_id.jvm_id());
            debug!(jvm = connection_id.jvm_id(), "Client process released");
        }
    }

    fn is_max_reached(&self) -> bool {
        self.clients.lock().len() >= self.max
    }

    fn max_connections(&self) -> Option<usize> {
        Some(self.max)
    }

    fn connection_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl fmt::Debug for MaxConnectionsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxConnectionsPolicy")
            .field("max", &self.max)
            .field("clients", &self.connection_count())
            .finish()
    }
}

/// Allocates channel ids for admitted connections
pub trait ConnectionIdFactory: Send + Sync {
    /// The client's presented identity, stamped with a fresh channel id
    ///
    /// `None` once the channel id space is used up.
    fn next_connection_id(&self, presented: &ConnectionId) -> Option<ConnectionId>;

    /// Never allocate any of `existing` again
    fn restore(&self, existing: &[ConnectionId]);

    fn server_id(&self) -> &str;
}

/// Counter from 0, stamped with the server id
///
/// The counter may reach `i64::MAX + 1`, which marks the id space as used up.
#[derive(Debug)]
pub struct DefaultConnectionIdFactory {
    next: AtomicU64,
    server_id: String,
}

const EXHAUSTED: u64 = i64::MAX as u64 + 1;

impl DefaultConnectionIdFactory {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            next: AtomicU64::new(0),
            server_id: server_id.into(),
        }
    }
}

impl ConnectionIdFactory for DefaultConnectionIdFactory {
    fn next_connection_id(&self, presented: &ConnectionId) -> Option<ConnectionId> {
        let Ok(allocated) = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| (next < EXHAUSTED).then_some(next + 1))
        else {
            warn!(server = %self.server_id, "Channel ids exhausted");
            return None;
        };
        let channel_id = i64::try_from(allocated).ok()?;
        Some(
            presented
                .clone()
                .with_channel_id(channel_id)
                .with_server_id(self.server_id.clone()),
        )
    }

    fn restore(&self, existing: &[ConnectionId]) {
        let highest = existing
            .iter()
            .filter_map(|id| u64::try_from(id.channel_id().to_long()).ok())
            .max();
        if let Some(highest) = highest {
            self.next.fetch_max(highest + 1, Ordering::AcqRel);
        }
    }

    fn server_id(&self) -> &str {
        &self.server_id
    }
}
