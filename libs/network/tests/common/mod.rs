//! Shared loopback fixtures for the integration tests

#![allow(dead_code)]

use bytes::BytesMut;
use comms_codec::{frame_length, HandshakeRequest, WireFrame, FRAME_LENGTH_PREFIX, STACK_VERSION};
use comms_network::config::CommsConfig;
use comms_network::{
    CommunicationsManager, ConnectionAddress, DefaultSessionProvider, ListenerOptions, MessageChannel,
    MessageMapping, NetworkListener, PingMessage,
};
use comms_types::{ConnectionId, MessageType, ProductId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Manager with ping and pong mapped
pub fn manager(name: &str) -> CommunicationsManager {
    manager_with(CommsConfig {
        name: name.to_string(),
        ..CommsConfig::default()
    })
}

pub fn manager_with(config: CommsConfig) -> CommunicationsManager {
    let manager = CommunicationsManager::new(config).unwrap();
    manager
        .add_class_mapping(MessageType::Ping, MessageMapping::of::<PingMessage>())
        .unwrap();
    manager
        .add_class_mapping(MessageType::Pong, MessageMapping::of::<PingMessage>())
        .unwrap();
    manager
}

/// Started loopback listener and the address clients should dial
pub async fn start_listener(
    server: &CommunicationsManager,
    options: ListenerOptions,
) -> (Arc<NetworkListener>, ConnectionAddress) {
    let listener = server
        .create_listener("127.0.0.1:0".parse().unwrap(), options)
        .unwrap();
    let bound = listener.start(Vec::new()).await.unwrap();
    (listener, bound.into())
}

pub fn client_channel(client: &CommunicationsManager, product: ProductId) -> Arc<MessageChannel> {
    client
        .create_client_channel(product, Arc::new(DefaultSessionProvider::new()), CONNECT_TIMEOUT)
        .unwrap()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Raw TCP handshake presenting `presented`; returns the server's reply
pub async fn handshake(bound: SocketAddr, presented: ConnectionId) -> (WireFrame, TcpStream) {
    let mut stream = TcpStream::connect(bound).await.unwrap();
    let request = HandshakeRequest {
        stack_version: STACK_VERSION,
        connection_id: presented,
        client_uuid: Uuid::new_v4(),
    };
    stream.write_all(&WireFrame::Handshake(request).encode().unwrap()).await.unwrap();
    let frame = read_frame(&mut stream).await;
    (frame, stream)
}

pub async fn read_frame(stream: &mut TcpStream) -> WireFrame {
    let mut prefix = [0u8; FRAME_LENGTH_PREFIX];
    stream.read_exact(&mut prefix).await.unwrap();
    let length = frame_length(prefix, 1 << 20).unwrap();
    let mut body = BytesMut::zeroed(length);
    stream.read_exact(&mut body).await.unwrap();
    WireFrame::decode(body.freeze()).unwrap()
}
