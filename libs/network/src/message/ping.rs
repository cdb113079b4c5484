//! Application-level ping
//!
//! `PING_MESSAGE` and `PONG_MESSAGE` share one body. A receiver answers a
//! ping with [`PingMessage::create_response`], which keeps the sequence
//! number so the sender can match replies.

use super::{MessagePayload, TcMessage, WireMessage};
use crate::error::{CommsError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use comms_codec::{ProtocolResult, WireRead, WireWrite};
use comms_types::MessageType;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingMessage {
    pub sequence: u64,
    pub note: String,
}

impl PingMessage {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            note: String::new(),
        }
    }

    /// Pong for a received ping, bound to the same channel
    pub fn create_response(request: &TcMessage) -> Result<TcMessage> {
        request.hydrate()?;
        let ping = request.payload::<PingMessage>().ok_or_else(|| {
            CommsError::illegal_state("create_response", format!("{} is not a ping", request.message_type()))
        })?;
        let mut response = request.channel().create_message(MessageType::Pong)?;
        if let Some(pong) = response.payload_mut::<PingMessage>() {
            pong.sequence = ping.sequence;
            pong.note = ping.note.clone();
        }
        Ok(response)
    }
}

impl MessagePayload for PingMessage {
    fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        out.put_u64(self.sequence);
        out.write_string("note", &self.note)
    }
}

impl WireMessage for PingMessage {
    fn decode(body: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            sequence: body.read_u64("sequence")?,
            note: body.read_string("note")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{detached_channel, inbound_message, inbound_raw};
    use std::sync::Arc;

    #[test]
    fn test_response_echoes_sequence() {
        let channel = detached_channel();
        let mut ping = PingMessage::new(9);
        ping.note = "hello".into();
        let request = inbound_message(&channel, MessageType::Ping, &ping);

        let response = PingMessage::create_response(&request).unwrap();
        assert_eq!(response.message_type(), MessageType::Pong);
        assert_eq!(response.payload::<PingMessage>(), Some(&ping));
        assert!(Arc::ptr_eq(response.channel(), &channel));
    }

    #[test]
    fn test_response_to_undecodable_ping_fails() {
        let channel = detached_channel();
        let request = inbound_raw(&channel, MessageType::Ping, Bytes::from_static(&[0, 0, 1]));
        assert!(PingMessage::create_response(&request).is_err());
    }

    #[test]
    fn test_overlong_note_fails_encode() {
        let channel = detached_channel();
        let mut ping = channel.create_message(MessageType::Ping).unwrap();
        ping.payload_mut::<PingMessage>().unwrap().note = "é".repeat(2049);
        let err = ping.encode().unwrap_err();
        assert!(matches!(
            err,
            CommsError::Protocol(comms_codec::ProtocolError::InvalidString { field: "note", .. })
        ));
        assert!(channel.is_open());
    }
}
