//! Message Factory
//!
//! Per-type construction table. One factory is shared by every channel a
//! client connection or listener creates, seeded from the owning manager's
//! mappings.

use super::{MessageMapping, TcMessage};
use crate::channel::MessageChannel;
use crate::error::{CommsError, Result};
use bytes::Bytes;
use comms_codec::MessageHeader;
use comms_types::MessageType;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds outbound and inbound [`TcMessage`]s from registered mappings
#[derive(Debug, Default)]
pub struct MessageFactory {
    mappings: DashMap<MessageType, MessageMapping>,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory pre-populated with a snapshot of mappings
    pub fn with_mappings(mappings: impl IntoIterator<Item = (MessageType, MessageMapping)>) -> Self {
        Self {
            mappings: mappings.into_iter().collect(),
        }
    }

    /// Register a mapping; a second registration for the same type is refused
    pub fn add_mapping(&self, message_type: MessageType, mapping: MessageMapping) -> Result<()> {
        match self.mappings.entry(message_type) {
            Entry::Occupied(_) => Err(CommsError::DuplicateMapping(message_type)),
            Entry::Vacant(slot) => {
                debug!(message_type = %message_type, ?mapping, "Registered message mapping");
                slot.insert(mapping);
                Ok(())
            }
        }
    }

    pub fn is_mapped(&self, message_type: MessageType) -> bool {
        self.mappings.contains_key(&message_type)
    }

    /// Registered types in code order
    pub fn mapped_types(&self) -> Vec<MessageType> {
        let mut types: Vec<MessageType> = self.mappings.iter().map(|entry| *entry.key()).collect();
        types.sort();
        types
    }

    /// Copy of every registered mapping
    pub(crate) fn snapshot(&self) -> Vec<(MessageType, MessageMapping)> {
        self.mappings
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// New outbound message of `message_type` bound to `channel`
    pub fn create_message(&self, channel: &Arc<MessageChannel>, message_type: MessageType) -> Result<TcMessage> {
        let constructor = self
            .mappings
            .get(&message_type)
            .and_then(|mapping| mapping.outbound.clone())
            .ok_or(CommsError::UnmappedMessageType {
                message_type,
                direction: "outbound",
            })?;
        Ok(TcMessage::outbound(Arc::clone(channel), message_type, constructor()))
    }

    /// Inbound message whose body stays encoded until hydration
    pub fn create_inbound(
        &self,
        channel: &Arc<MessageChannel>,
        header: MessageHeader,
        message_type: MessageType,
        body: Bytes,
    ) -> Result<TcMessage> {
        let decoder = self
            .mappings
            .get(&message_type)
            .and_then(|mapping| mapping.inbound.clone())
            .ok_or(CommsError::UnmappedMessageType {
                message_type,
                direction: "inbound",
            })?;
        Ok(TcMessage::inbound(Arc::clone(channel), header, message_type, body, decoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PingMessage;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_mapping_keeps_first() {
        let factory = MessageFactory::new();
        factory
            .add_mapping(MessageType::Ping, MessageMapping::outbound_only::<PingMessage>())
            .unwrap();
        let err = factory
            .add_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
            .unwrap_err();
        assert!(matches!(err, CommsError::DuplicateMapping(MessageType::Ping)));

        // first registration (send-only) is still in place
        let entry = factory.mappings.get(&MessageType::Ping).unwrap();
        assert!(entry.has_outbound());
        assert!(!entry.has_inbound());
    }

    #[test]
    fn test_mapped_types_sorted() {
        let factory = MessageFactory::with_mappings([
            (MessageType::Pong, MessageMapping::of::<PingMessage>()),
            (MessageType::Ping, MessageMapping::of::<PingMessage>()),
        ]);
        assert_eq!(factory.mapped_types(), vec![MessageType::Ping, MessageType::Pong]);
        assert!(!factory.is_mapped(MessageType::Jmx));
    }

    proptest! {
        #[test]
        fn prop_second_registration_always_fails(index in 0usize..MessageType::ALL.len()) {
            let message_type = MessageType::ALL[index];
            let factory = MessageFactory::new();
            prop_assert!(factory.add_mapping(message_type, MessageMapping::of::<PingMessage>()).is_ok());
            let second = factory.add_mapping(message_type, MessageMapping::inbound_only::<PingMessage>());
            let is_duplicate = matches!(second, Err(CommsError::DuplicateMapping(t)) if t == message_type);
            prop_assert!(is_duplicate);
            prop_assert!(factory.mappings.get(&message_type).unwrap().has_outbound());
        }
    }
}
