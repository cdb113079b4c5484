//! Serde shape of the identifier vocabulary
//!
//! State dumps and configuration files carry these ids as JSON/TOML, so the
//! long ids must stay transparent integers.

use comms_types::{ChannelId, ConnectionId, MessageType, NodeId, ProductId, ServerId, SessionId};

#[test]
fn test_long_ids_serialize_as_plain_integers() {
    let channel = ChannelId::new(12).unwrap();
    assert_eq!(serde_json::to_string(&channel).unwrap(), "12");
    assert_eq!(serde_json::to_string(&ChannelId::NULL).unwrap(), "-1");
    assert_eq!(serde_json::from_str::<SessionId>("3").unwrap().to_long(), 3);
}

#[test]
fn test_connection_id_round_trips_through_json() {
    let id = ConnectionId::new(5, "pid-99", "server-a", ProductId::Diagnostic);
    let json = serde_json::to_string(&id).unwrap();
    let back: ConnectionId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
    assert_eq!(back.product(), ProductId::Diagnostic);
}

#[test]
fn test_node_id_variants_are_tagged() {
    let server = NodeId::from(ServerId::generate("l2"));
    let value = serde_json::to_value(&server).unwrap();
    assert!(value.get("Server").is_some());

    let client = serde_json::to_value(NodeId::NULL_CLIENT).unwrap();
    assert_eq!(client, serde_json::json!({ "Client": -1 }));
}

#[test]
fn test_message_type_serializes_by_name() {
    let value = serde_json::to_value(MessageType::ClientHandshakeAck).unwrap();
    assert_eq!(value, serde_json::json!("ClientHandshakeAck"));
}

#[test]
fn test_non_null_rejects_sentinel() {
    assert!(ChannelId::NULL.non_null().is_err());
    assert!(ChannelId::new(0).unwrap().non_null().is_ok());
}
