//! Typed Channel Messages
//!
//! A [`TcMessage`] is one directed, typed payload bound to the channel it was
//! created on or received from. Outbound messages carry their payload from
//! construction; inbound messages keep the raw body bytes and only decode
//! them when [`TcMessage::hydrate`] is called, after routing.
//!
//! Payload types implement [`WireMessage`] and are registered per
//! [`MessageType`] through a [`MessageMapping`]:
//!
//! ```rust,ignore
//! manager.add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())?;
//! ```

pub mod factory;
pub mod handshake;
pub mod monitor;
pub mod parser;
pub mod ping;
pub mod router;
pub mod sinks;

use crate::channel::MessageChannel;
use crate::error::{CommsError, Result};
use bytes::{Bytes, BytesMut};
use comms_codec::{MessageHeader, ProtocolError, ProtocolResult};
use comms_types::{MessageType, NodeId, SessionId};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub use factory::MessageFactory;
pub use handshake::{ClientHandshakeAckMessage, ClientHandshakeMessage, ClientHandshakeRefusedMessage};
pub use monitor::{MessageMonitor, MessageMonitorImpl, MonitorCounts, NullMessageMonitor};
pub use parser::MessageParser;
pub use ping::PingMessage;
pub use router::{MessageRouter, MessageSink};
pub use sinks::{HydrateSink, QueueSink, UnsupportedMessageSink};

/// Downcasting support for payload trait objects
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Body of a typed message
pub trait MessagePayload: AsAny + Send + Sync + fmt::Debug + 'static {
    /// Append the body encoding to `out`
    fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()>;
}

/// A payload that can be built empty for sending and decoded on receipt
pub trait WireMessage: MessagePayload + Default + Sized {
    fn decode(body: &mut Bytes) -> ProtocolResult<Self>;
}

/// Builds an empty outbound payload
pub type OutboundConstructor = Arc<dyn Fn() -> Box<dyn MessagePayload> + Send + Sync>;

/// Decodes an inbound body
pub type InboundDecoder = Arc<dyn Fn(&mut Bytes) -> ProtocolResult<Box<dyn MessagePayload>> + Send + Sync>;

/// Per-type construction table entry
///
/// Either direction may be absent: some types are only ever sent by this
/// node, others only received.
#[derive(Clone, Default)]
pub struct MessageMapping {
    pub(crate) outbound: Option<OutboundConstructor>,
    pub(crate) inbound: Option<InboundDecoder>,
}

impl MessageMapping {
    /// Both directions for a [`WireMessage`]
    pub fn of<P: WireMessage>() -> Self {
        Self::outbound_only::<P>().with_inbound(Self::decoder::<P>())
    }

    /// Send-only mapping
    pub fn outbound_only<P: WireMessage>() -> Self {
        Self {
            outbound: Some(Arc::new(|| Box::new(P::default()) as Box<dyn MessagePayload>)),
            inbound: None,
        }
    }

    /// Receive-only mapping
    pub fn inbound_only<P: WireMessage>() -> Self {
        Self {
            outbound: None,
            inbound: Some(Self::decoder::<P>()),
        }
    }

    /// Mapping from explicit closures
    pub fn from_fns(outbound: Option<OutboundConstructor>, inbound: Option<InboundDecoder>) -> Self {
        Self { outbound, inbound }
    }

    pub fn with_inbound(mut self, inbound: InboundDecoder) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    fn decoder<P: WireMessage>() -> InboundDecoder {
        Arc::new(|body: &mut Bytes| P::decode(body).map(|p| Box::new(p) as Box<dyn MessagePayload>))
    }
}

impl fmt::Debug for MessageMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMapping")
            .field("outbound", &self.has_outbound())
            .field("inbound", &self.has_inbound())
            .finish()
    }
}

/// A typed message bound to one channel
pub struct TcMessage {
    message_type: MessageType,
    channel: Arc<MessageChannel>,
    session: SessionId,
    source: NodeId,
    destination: NodeId,
    header: Option<MessageHeader>,
    raw: Bytes,
    decoder: Option<InboundDecoder>,
    body: OnceCell<Box<dyn MessagePayload>>,
}

impl TcMessage {
    pub(crate) fn outbound(
        channel: Arc<MessageChannel>,
        message_type: MessageType,
        payload: Box<dyn MessagePayload>,
    ) -> Self {
        Self {
            message_type,
            session: channel.session_id(),
            source: channel.local_node_id(),
            destination: channel.remote_node_id(),
            channel,
            header: None,
            raw: Bytes::new(),
            decoder: None,
            body: OnceCell::with_value(payload),
        }
    }

    pub(crate) fn inbound(
        channel: Arc<MessageChannel>,
        header: MessageHeader,
        message_type: MessageType,
        raw: Bytes,
        decoder: InboundDecoder,
    ) -> Self {
        Self {
            message_type,
            session: channel.session_id(),
            source: channel.remote_node_id(),
            destination: channel.local_node_id(),
            channel,
            header: Some(header),
            raw,
            decoder: Some(decoder),
            body: OnceCell::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    /// Session of the channel when this message was created or received
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn source_node_id(&self) -> &NodeId {
        &self.source
    }

    pub fn destination_node_id(&self) -> &NodeId {
        &self.destination
    }

    /// Wire header; `None` for messages created locally
    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    /// Undecoded body bytes of an inbound message
    pub fn raw_body(&self) -> &Bytes {
        &self.raw
    }

    pub fn is_hydrated(&self) -> bool {
        self.body.get().is_some()
    }

    /// Decode the body if that has not happened yet
    ///
    /// Idempotent. The body must decode completely; leftover bytes mean the
    /// peer and this node disagree on the layout.
    pub fn hydrate(&self) -> Result<()> {
        if self.is_hydrated() {
            return Ok(());
        }
        let decoder = self.decoder.as_ref().ok_or(CommsError::UnmappedMessageType {
            message_type: self.message_type,
            direction: "inbound",
        })?;
        self.body.get_or_try_init(|| {
            let mut body = self.raw.clone();
            let payload = decoder(&mut body)?;
            if !body.is_empty() {
                return Err(ProtocolError::body_decode(
                    self.message_type,
                    format!("{} trailing bytes", body.len()),
                ));
            }
            Ok(payload)
        })?;
        Ok(())
    }

    /// Typed view of the payload; `None` before hydration or on a type mismatch
    pub fn payload<P: MessagePayload>(&self) -> Option<&P> {
        let body = self.body.get()?;
        <dyn MessagePayload as AsAny>::as_any(&**body).downcast_ref::<P>()
    }

    /// Mutable typed view, used to fill in an outbound message
    pub fn payload_mut<P: MessagePayload>(&mut self) -> Option<&mut P> {
        let body = self.body.get_mut()?;
        <dyn MessagePayload as AsAny>::as_any_mut(&mut **body).downcast_mut::<P>()
    }

    /// Header plus body, ready to be wrapped in a message frame
    pub(crate) fn encode(&self) -> Result<Bytes> {
        let payload = self.body.get().ok_or_else(|| {
            CommsError::illegal_state("encode", format!("{} has no payload", self.message_type))
        })?;
        let mut body = BytesMut::new();
        payload.encode(&mut body)?;
        let length = body_length(body.len())?;

        let mut out = BytesMut::with_capacity(MessageHeader::SIZE + body.len());
        MessageHeader::new(self.message_type, length).encode(&mut out);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Send on the owning channel
    pub fn send(self) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        channel.send(self)
    }
}

/// Header length field for a body of `len` bytes
fn body_length(len: usize) -> ProtocolResult<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

impl fmt::Debug for TcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcMessage")
            .field("type", &self.message_type)
            .field("channel", &self.channel.channel_id())
            .field("session", &self.session)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("body", &self.body.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_length_fits_header_field() {
        assert_eq!(body_length(0).unwrap(), 0);
        assert_eq!(body_length(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_body_length_beyond_u32_is_refused() {
        let len = u32::MAX as usize + 1;
        assert!(matches!(
            body_length(len),
            Err(ProtocolError::FrameTooLarge { size, .. }) if size == len
        ));
    }
}
