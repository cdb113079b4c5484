//! Channel status and lifecycle events

use super::MessageChannel;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// `Init → Open → Closed`; only a client `reset()` leaves `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Init,
    Open,
    Closed,
}

impl ChannelStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelStatus::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelStatus::Closed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelStatus::Init => "INIT",
            ChannelStatus::Open => "OPEN",
            ChannelStatus::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelEventType {
    Opened,
    Closed,
    TransportConnected,
    TransportDisconnected,
    TransportConnectAttempt,
    TransportClosed,
    TransportReconnectionRejected,
}

#[derive(Debug, Clone)]
pub struct ChannelEvent {
    event_type: ChannelEventType,
    channel: Arc<MessageChannel>,
}

impl ChannelEvent {
    pub(crate) fn new(event_type: ChannelEventType, channel: Arc<MessageChannel>) -> Self {
        Self { event_type, channel }
    }

    pub fn event_type(&self) -> ChannelEventType {
        self.event_type
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }
}

/// Observer of one channel's lifecycle
///
/// Called on whichever task produced the event, never with channel locks
/// held. Listeners live as long as the channel.
pub trait ChannelEventListener: Send + Sync {
    fn notify(&self, event: &ChannelEvent);
}

impl<F> ChannelEventListener for F
where
    F: Fn(&ChannelEvent) + Send + Sync,
{
    fn notify(&self, event: &ChannelEvent) {
        self(event)
    }
}
