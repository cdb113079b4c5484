//! Message Parser
//!
//! Turns a message frame body into a [`TcMessage`]: header decode, length
//! self-check, type resolution, then factory lookup. Synchronous and
//! allocation-light; the body is sliced, never copied.

use super::{MessageFactory, TcMessage};
use crate::channel::MessageChannel;
use crate::error::Result;
use bytes::Bytes;
use comms_codec::MessageHeader;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MessageParser {
    factory: Arc<MessageFactory>,
}

impl MessageParser {
    pub fn new(factory: Arc<MessageFactory>) -> Self {
        Self { factory }
    }

    /// Decode `frame` as a message received on `channel`
    ///
    /// Every error here is fatal to the connection: a bad header length, an
    /// unknown type code or a type with no inbound mapping all mean the
    /// peers disagree on the wire format.
    pub fn parse_message(&self, channel: &Arc<MessageChannel>, frame: Bytes) -> Result<TcMessage> {
        let mut body = frame;
        let header = MessageHeader::decode(&mut body)?;
        let message_type = header.resolve_type()?;
        self.factory.create_inbound(channel, header, message_type, body)
    }

    pub fn factory(&self) -> &Arc<MessageFactory> {
        &self.factory
    }
}
