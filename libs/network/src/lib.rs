//! # Communications Network
//!
//! Typed message channels over managed TCP connections.
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → libs/codec → [network]
//!                              │
//!   CommunicationsManager ─────┼── client channels ── TcpConnector
//!                              └── NetworkListener ── ChannelManager ── server channels
//! ```
//!
//! - [`message`]: typed messages, per-manager mappings, parser, router, sinks, monitor
//! - [`channel`]: the channel state machine and the per-listener registry
//! - [`transport`]: TCP transports, the client connector and health probes
//! - [`comms`]: the manager facade, listeners, admission policy
//!
//! ## Usage
//!
//! ```rust,ignore
//! let server = CommunicationsManager::new(CommsConfig::default())?;
//! server.add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())?;
//! server.router().route_message_type(MessageType::Ping, Arc::new(HydrateSink::new(|m| handle(m))));
//! let listener = server.create_listener("127.0.0.1:0".parse()?, ListenerOptions::default())?;
//! let addr = listener.start(Vec::new()).await?;
//!
//! let client = CommunicationsManager::new(CommsConfig::default())?;
//! client.add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())?;
//! let channel = client.create_client_channel(ProductId::Stripe, Arc::new(DefaultSessionProvider::new()), timeout)?;
//! channel.open(&[addr.into()]).await?;
//! channel.create_message(MessageType::Ping)?.send()?;
//! ```

pub mod channel;
pub mod comms;
pub mod config;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use channel::{
    ChannelEvent, ChannelEventListener, ChannelEventType, ChannelManager, ChannelManagerEventListener, ChannelStatus,
    MessageChannel,
};
pub use comms::{CommunicationsManager, ListenerOptions, NetworkListener};
pub use config::CommsConfig;
pub use error::{CommsError, Result, RoutingError};
pub use message::{
    HydrateSink, MessageMapping, MessagePayload, MessageRouter, MessageSink, PingMessage, QueueSink, TcMessage,
    WireMessage,
};
pub use session::{DefaultSessionProvider, SessionProvider};
pub use transport::ConnectionAddress;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::channel::{ChannelParts, MessageChannel};
    use crate::message::handshake::builtin_mappings;
    use crate::message::{MessageFactory, MessageMapping, MessagePayload, MessageRouter, NullMessageMonitor, PingMessage, TcMessage};
    use bytes::{Bytes, BytesMut};
    use comms_codec::MessageHeader;
    use comms_types::{ConnectionId, MessageType, ProductId, ServerId};
    use std::sync::Arc;

    /// Parts with ping, pong and the handshake types mapped
    pub fn test_parts() -> ChannelParts {
        let factory = MessageFactory::with_mappings(builtin_mappings());
        factory
            .add_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap();
        factory
            .add_mapping(MessageType::Pong, MessageMapping::of::<PingMessage>())
            .unwrap();
        ChannelParts {
            factory: Arc::new(factory),
            router: Arc::new(MessageRouter::new()),
            monitor: Arc::new(NullMessageMonitor),
            health: None,
        }
    }

    /// Open server channel with no transport behind it
    pub fn detached_channel() -> Arc<MessageChannel> {
        MessageChannel::new_server(
            test_parts(),
            ConnectionId::new(1, "test-jvm", "test", ProductId::Stripe),
            ServerId::generate("test"),
        )
    }

    /// Header plus body, as a message frame carries it
    pub fn message_frame(message_type: MessageType, payload: &impl MessagePayload) -> Bytes {
        let mut body = BytesMut::new();
        payload.encode(&mut body).unwrap();
        let mut frame = BytesMut::new();
        MessageHeader::new(message_type, body.len() as u32).encode(&mut frame);
        frame.extend_from_slice(&body);
        frame.freeze()
    }

    /// Received-but-not-hydrated message carrying `payload`
    pub fn inbound_message(
        channel: &Arc<MessageChannel>,
        message_type: MessageType,
        payload: &impl MessagePayload,
    ) -> TcMessage {
        let mut body = BytesMut::new();
        payload.encode(&mut body).unwrap();
        inbound_raw(channel, message_type, body.freeze())
    }

    /// Received message with an arbitrary body
    pub fn inbound_raw(channel: &Arc<MessageChannel>, message_type: MessageType, body: Bytes) -> TcMessage {
        let header = MessageHeader::new(message_type, body.len() as u32);
        test_parts()
            .factory
            .create_inbound(channel, header, message_type, body)
            .unwrap()
    }
}
