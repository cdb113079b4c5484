//! Reconnects and handshake refusals over loopback TCP

mod common;

use common::{client_channel, eventually, handshake, manager, manager_with, read_frame, start_listener};
use comms_codec::{HandshakeRequest, HandshakeStatus, WireFrame, STACK_VERSION};
use comms_network::config::{ListenerConfig, ReconnectConfig};
use comms_network::{
    ChannelEvent, ChannelEventType, ChannelStatus, CommsConfig, CommsError, ListenerOptions, PingMessage, QueueSink,
};
use comms_types::{ConnectionId, MessageType, ProductId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use uuid::Uuid;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_reopen_after_dropped_connection_keeps_channel() {
    let server = manager("server");
    let (sink, mut inbox) = QueueSink::channel();
    server.router().route_message_type(MessageType::Ping, Arc::new(sink));
    let (listener, address) = start_listener(&server, ListenerOptions::default()).await;

    let client = manager("client");
    let channel = client_channel(&client, ProductId::Stripe);
    let first_id = channel.open(&[address]).await.unwrap();
    let first_session = channel.session_id();
    assert_eq!(channel.connect_count(), 1);

    channel.current_transport().unwrap().drop_connection();
    assert!(eventually(|| !channel.is_connected()).await);
    assert_eq!(channel.status(), ChannelStatus::Open);
    assert!(eventually(|| channel.session_id() > first_session).await);

    // The server keeps the channel of a reconnecting product
    let server_channel = listener.channel_manager().get_channel(first_id.channel_id()).unwrap();
    assert!(eventually(|| !server_channel.is_connected()).await);
    assert!(server_channel.is_open());

    let reopened_id = channel.reopen().await.unwrap();
    assert_eq!(reopened_id.channel_id(), first_id.channel_id());
    assert_eq!(channel.channel_id(), first_id.channel_id());
    assert_eq!(channel.connect_count(), 2);
    assert!(channel.session_id() > first_session);
    assert_eq!(listener.channel_manager().channel_count(), 1);

    let mut ping = channel.create_message(MessageType::Ping).unwrap();
    ping.payload_mut::<PingMessage>().unwrap().sequence = 7;
    ping.send().unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(received.channel(), &server_channel));

    server.shutdown().await;
    client.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_automatic_reconnect() {
    let server = manager("server");
    let (_listener, address) = start_listener(&server, ListenerOptions::default()).await;

    let client = manager_with(CommsConfig {
        name: "client".to_string(),
        reconnect: ReconnectConfig {
            enabled: true,
            interval_ms: 20,
            max_attempts: 50,
        },
        ..CommsConfig::default()
    });
    let channel = client_channel(&client, ProductId::Stripe);
    channel.open(&[address]).await.unwrap();

    channel.current_transport().unwrap().drop_connection();
    assert!(eventually(|| channel.connect_count() == 2 && channel.is_connected()).await);
    assert!(channel.is_open());

    server.shutdown().await;
    client.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_reconnect_to_forgotten_channel_closes_client() {
    let server = manager("server");
    let (listener, address) = start_listener(&server, ListenerOptions::default()).await;

    let client = manager("client");
    let channel = client_channel(&client, ProductId::Stripe);
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    channel.add_listener(Arc::new(move |event: &ChannelEvent| seen.lock().push(event.event_type())));
    let id = channel.open(&[address]).await.unwrap();

    channel.current_transport().unwrap().drop_connection();
    assert!(eventually(|| !channel.is_connected()).await);
    let server_channel = listener.channel_manager().get_channel(id.channel_id()).unwrap();
    assert!(server_channel.close());
    assert_eq!(listener.channel_manager().channel_count(), 0);

    let error = channel.reopen().await.unwrap_err();
    assert!(matches!(error, CommsError::ReconnectionRejected { .. }));
    assert!(channel.is_closed());
    let events = events.lock().clone();
    assert!(events.contains(&ChannelEventType::TransportReconnectionRejected));
    assert_eq!(events.last(), Some(&ChannelEventType::Closed));

    server.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_seeded_connection_id_may_reconnect() {
    let server = manager("server");
    let listener = server
        .create_listener("127.0.0.1:0".parse().unwrap(), ListenerOptions::default())
        .unwrap();
    // Issued by an earlier server instance
    let seeded = ConnectionId::new(5, "jvm-a", "previous-server", ProductId::Permanent);
    let bound = listener.start(vec![seeded.clone()]).await.unwrap();

    // Same channel id from another process
    let impostor = ConnectionId::new(5, "jvm-z", "previous-server", ProductId::Permanent);
    let (frame, _stream) = handshake(bound, impostor).await;
    match frame {
        WireFrame::HandshakeAck(response) => assert_eq!(response.status, HandshakeStatus::ReconnectionRejected),
        other => panic!("expected handshake ack, got {other:?}"),
    }
    assert!(listener.channel_manager().get_channel(seeded.channel_id()).is_none());

    let (frame, _stream) = handshake(bound, seeded.clone()).await;
    match frame {
        WireFrame::HandshakeAck(response) => {
            assert_eq!(response.status, HandshakeStatus::Ok);
            assert_eq!(response.connection_id.channel_id(), seeded.channel_id());
        }
        other => panic!("expected handshake ack, got {other:?}"),
    }
    assert!(listener.channel_manager().get_channel(seeded.channel_id()).is_some());

    let unknown = ConnectionId::new(6, "jvm-b", "previous-server", ProductId::Permanent);
    let (frame, _stream) = handshake(bound, unknown).await;
    match frame {
        WireFrame::HandshakeAck(response) => assert_eq!(response.status, HandshakeStatus::ReconnectionRejected),
        other => panic!("expected handshake ack, got {other:?}"),
    }

    server.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_reconnect_from_other_process_is_refused() {
    let server = manager("server");
    let (listener, address) = start_listener(&server, ListenerOptions::default()).await;
    let bound = listener.bound_address().unwrap();

    let client = manager("client");
    let channel = client_channel(&client, ProductId::Stripe);
    let id = channel.open(&[address]).await.unwrap();
    let server_channel = listener.channel_manager().get_channel(id.channel_id()).unwrap();
    assert!(eventually(|| server_channel.is_connected()).await);

    let hijack = ConnectionId::new(id.channel_id().to_long(), "other-jvm", id.server_id(), ProductId::Stripe);
    let (frame, _stream) = handshake(bound, hijack).await;
    match frame {
        WireFrame::HandshakeAck(response) => assert_eq!(response.status, HandshakeStatus::ReconnectionRejected),
        other => panic!("expected handshake ack, got {other:?}"),
    }

    // The owner's transport is untouched
    assert!(server_channel.is_connected());
    assert!(channel.is_connected());
    let (sink, mut inbox) = QueueSink::channel();
    server.router().route_message_type(MessageType::Ping, Arc::new(sink));
    channel.create_message(MessageType::Ping).unwrap().send().unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(received.channel(), &server_channel));

    server.shutdown().await;
    client.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_crashed_client_releases_slot_after_reconnect_window() {
    let server = manager_with(CommsConfig {
        name: "server".to_string(),
        max_connections: Some(1),
        listener: ListenerConfig {
            reconnect_window_ms: 100,
            ..ListenerConfig::default()
        },
        ..CommsConfig::default()
    });
    let (listener, address) = start_listener(&server, ListenerOptions::default()).await;

    let crashed = manager("crashed");
    let channel = client_channel(&crashed, ProductId::Stripe);
    channel.open(&[address.clone()]).await.unwrap();
    channel.current_transport().unwrap().drop_connection();
    drop(channel);
    drop(crashed);

    assert!(eventually(|| listener.channel_manager().channel_count() == 0).await);
    assert_eq!(listener.policy().connection_count(), 0);

    let next = manager("next");
    let next_channel = client_channel(&next, ProductId::Stripe);
    next_channel.open(&[address]).await.unwrap();
    assert!(next_channel.is_open());

    server.shutdown().await;
    next.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_max_connections_refuses_second_client() {
    let server = manager_with(CommsConfig {
        name: "server".to_string(),
        max_connections: Some(1),
        ..CommsConfig::default()
    });
    let (listener, address) = start_listener(&server, ListenerOptions::default()).await;

    let first = manager("first");
    let first_channel = client_channel(&first, ProductId::Stripe);
    first_channel.open(&[address.clone()]).await.unwrap();

    // Channels from the same process share its slot
    let sibling = client_channel(&first, ProductId::Stripe);
    sibling.open(&[address.clone()]).await.unwrap();

    let second = manager("second");
    let second_channel = client_channel(&second, ProductId::Stripe);
    let error = second_channel.open(&[address.clone()]).await.unwrap_err();
    assert!(matches!(error, CommsError::MaxConnectionsExceeded { .. }));
    assert_eq!(second_channel.status(), ChannelStatus::Init);

    // Internal products are not counted
    let diagnostic = client_channel(&second, ProductId::Diagnostic);
    diagnostic.open(&[address.clone()]).await.unwrap();

    // Releasing the slot lets the other process in
    assert!(first_channel.close());
    assert!(sibling.close());
    assert!(eventually(|| listener.policy().connection_count() == 0).await);
    second_channel.open(&[address]).await.unwrap();

    server.shutdown().await;
    first.shutdown().await;
    second.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_stack_mismatch_is_refused() {
    let server = manager("server");
    let (listener, address) = start_listener(&server, ListenerOptions::default()).await;
    let bound = listener.bound_address().unwrap();
    assert_eq!(bound.port(), address.port);

    let mut stream = TcpStream::connect(bound).await.unwrap();
    let request = HandshakeRequest {
        stack_version: STACK_VERSION + 1,
        connection_id: ConnectionId::null(),
        client_uuid: Uuid::new_v4(),
    };
    stream.write_all(&WireFrame::Handshake(request).encode().unwrap()).await.unwrap();
    match read_frame(&mut stream).await {
        WireFrame::HandshakeAck(response) => assert_eq!(response.status, HandshakeStatus::StackMismatch),
        other => panic!("expected handshake ack, got {other:?}"),
    }
    assert_eq!(listener.channel_manager().channel_count(), 0);

    server.shutdown().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_validator_rejects_client() {
    let server = manager("server");
    let options = ListenerOptions {
        validator: Some(Arc::new(|id: &ConnectionId| {
            id.credentials().is_some_and(|c| c.password == "secret")
        })),
        ..ListenerOptions::default()
    };
    let (_listener, address) = start_listener(&server, options).await;

    let client = manager("client");
    let rejected = client_channel(&client, ProductId::Stripe);
    let error = rejected.open_with_credentials(&[address.clone()], "app", "wrong").await.unwrap_err();
    assert!(matches!(error, CommsError::Rejected { .. }));

    let accepted = client_channel(&client, ProductId::Stripe);
    accepted.open_with_credentials(&[address], "app", "secret").await.unwrap();
    assert!(accepted.is_open());

    server.shutdown().await;
    client.shutdown().await;
}
