//! Client handshake messages
//!
//! Sent once per connection, after the transport handshake, so the server
//! can identify the client software. Every communications manager maps
//! these types at construction.

use super::{MessageMapping, MessagePayload, WireMessage};
use bytes::{BufMut, Bytes, BytesMut};
use comms_codec::{ProtocolResult, WireRead, WireWrite};
use comms_types::MessageType;
use uuid::Uuid;

/// CLIENT_HANDSHAKE_MESSAGE: client version, uuid, process id and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshakeMessage {
    pub client_version: String,
    pub client_uuid: Uuid,
    pub pid: u32,
    pub name: String,
}

impl Default for ClientHandshakeMessage {
    fn default() -> Self {
        Self {
            client_version: String::new(),
            client_uuid: Uuid::nil(),
            pid: 0,
            name: String::new(),
        }
    }
}

impl MessagePayload for ClientHandshakeMessage {
    fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        out.write_string("client_version", &self.client_version)?;
        out.write_uuid(&self.client_uuid);
        out.put_u32(self.pid);
        out.write_string("name", &self.name)
    }
}

impl WireMessage for ClientHandshakeMessage {
    fn decode(body: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            client_version: body.read_string("client_version")?,
            client_uuid: body.read_uuid("client_uuid")?,
            pid: body.read_u32("pid")?,
            name: body.read_string("name")?,
        })
    }
}

/// CLIENT_HANDSHAKE_ACK_MESSAGE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHandshakeAckMessage {
    pub server_version: String,
    /// Server keeps client state across its own restarts
    pub persistent_server: bool,
}

impl MessagePayload for ClientHandshakeAckMessage {
    fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        out.write_string("server_version", &self.server_version)?;
        out.write_bool(self.persistent_server);
        Ok(())
    }
}

impl WireMessage for ClientHandshakeAckMessage {
    fn decode(body: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            server_version: body.read_string("server_version")?,
            persistent_server: body.read_bool("persistent_server")?,
        })
    }
}

/// CLIENT_HANDSHAKE_REFUSED_MESSAGE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHandshakeRefusedMessage {
    pub reason: String,
}

impl MessagePayload for ClientHandshakeRefusedMessage {
    fn encode(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        out.write_string("reason", &self.reason)
    }
}

impl WireMessage for ClientHandshakeRefusedMessage {
    fn decode(body: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            reason: body.read_string("reason")?,
        })
    }
}

/// Mappings every communications manager starts with
pub(crate) fn builtin_mappings() -> [(MessageType, MessageMapping); 3] {
    [
        (MessageType::ClientHandshake, MessageMapping::of::<ClientHandshakeMessage>()),
        (MessageType::ClientHandshakeAck, MessageMapping::of::<ClientHandshakeAckMessage>()),
        (MessageType::ClientHandshakeRefused, MessageMapping::of::<ClientHandshakeRefusedMessage>()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{detached_channel, inbound_message};

    #[test]
    fn test_handshake_body_hydrates() {
        let sent = ClientHandshakeMessage {
            client_version: "4.1.0".into(),
            client_uuid: Uuid::new_v4(),
            pid: 4242,
            name: "worker-3".into(),
        };
        let channel = detached_channel();
        let received = inbound_message(&channel, MessageType::ClientHandshake, &sent);
        received.hydrate().unwrap();
        assert_eq!(received.payload::<ClientHandshakeMessage>(), Some(&sent));
        assert!(received.payload::<ClientHandshakeAckMessage>().is_none());
    }

    #[test]
    fn test_refused_trailing_bytes_rejected() {
        let channel = detached_channel();
        let mut refused = ClientHandshakeRefusedMessage::default();
        refused.reason = "version skew".into();
        // a ping-shaped body does not decode as a refusal without leftovers
        let message = inbound_message(&channel, MessageType::ClientHandshakeRefused, &crate::message::PingMessage::new(3));
        assert!(message.hydrate().is_err());

        let ok = inbound_message(&channel, MessageType::ClientHandshakeRefused, &refused);
        ok.hydrate().unwrap();
        assert_eq!(ok.payload::<ClientHandshakeRefusedMessage>().unwrap().reason, "version skew");
    }
}
