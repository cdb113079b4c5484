//! Transport Frames
//!
//! Everything on a TCP connection travels as a length-prefixed frame:
//!
//! ```text
//! ┌──────────────┬──────┬─────────────────────────┐
//! │ length (u32) │ kind │ body (length - 1 bytes) │
//! └──────────────┴──────┴─────────────────────────┘
//! ```
//!
//! `length` counts the kind byte plus the body. Message frames carry a
//! complete [`MessageHeader`](crate::MessageHeader) plus payload; the other
//! kinds belong to the transport itself (handshake, health probes, goodbye).

use crate::constants::FRAME_LENGTH_PREFIX;
use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::{WireRead, WireWrite};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use comms_types::{ConnectionId, Credentials, ProductId, ServerId};
use uuid::Uuid;

/// Frame kind tag, the first byte after the length prefix
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
pub enum FrameKind {
    Handshake = 1,
    HandshakeAck = 2,
    Message = 3,
    Ping = 4,
    Pong = 5,
    Goodbye = 6,
}

/// Outcome of a transport handshake as decided by the server
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
pub enum HandshakeStatus {
    Ok = 0,
    MaxConnectionsExceeded = 1,
    StackMismatch = 2,
    ReconnectionRejected = 3,
    Rejected = 4,
}

impl HandshakeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HandshakeStatus::Ok)
    }
}

/// First frame a client sends on a fresh TCP connection
///
/// `connection_id` is null for a brand-new connection and carries the
/// previously assigned id when the client is reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub stack_version: u16,
    pub connection_id: ConnectionId,
    pub client_uuid: Uuid,
}

impl HandshakeRequest {
    pub fn product(&self) -> ProductId {
        self.connection_id.product()
    }

    pub fn is_reconnect(&self) -> bool {
        self.connection_id.is_valid()
    }

    fn encode_body(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        out.put_u16(self.stack_version);
        put_connection_id(out, &self.connection_id)?;
        out.write_uuid(&self.client_uuid);
        Ok(())
    }

    fn decode_body(body: &mut Bytes) -> ProtocolResult<Self> {
        Ok(Self {
            stack_version: body.read_u16("stack_version")?,
            connection_id: get_connection_id(body)?,
            client_uuid: body.read_uuid("client_uuid")?,
        })
    }
}

/// Server answer to a [`HandshakeRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    pub connection_id: ConnectionId,
    pub server_id: ServerId,
    /// Human readable reason for a refusal; empty on success
    pub detail: String,
}

impl HandshakeResponse {
    pub fn accepted(connection_id: ConnectionId, server_id: ServerId) -> Self {
        Self {
            status: HandshakeStatus::Ok,
            connection_id,
            server_id,
            detail: String::new(),
        }
    }

    pub fn refused(status: HandshakeStatus, server_id: ServerId, detail: impl Into<String>) -> Self {
        Self {
            status,
            connection_id: ConnectionId::null(),
            server_id,
            detail: detail.into(),
        }
    }

    fn encode_body(&self, out: &mut BytesMut) -> ProtocolResult<()> {
        out.put_u8(self.status.into());
        put_connection_id(out, &self.connection_id)?;
        out.write_string("server_name", self.server_id.name())?;
        out.write_uuid(&self.server_id.uid());
        out.write_string("detail", &self.detail)
    }

    fn decode_body(body: &mut Bytes) -> ProtocolResult<Self> {
        let raw_status = body.read_u8("handshake_status")?;
        let status = HandshakeStatus::try_from(raw_status).map_err(|_| {
            ProtocolError::invalid_field("handshake_status", format!("unknown status {raw_status}"))
        })?;
        let connection_id = get_connection_id(body)?;
        let name = body.read_string("server_name")?;
        let uid = body.read_uuid("server_uid")?;
        Ok(Self {
            status,
            connection_id,
            server_id: ServerId::from_parts(name, uid),
            detail: body.read_string("detail")?,
        })
    }
}

/// One decoded transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Handshake(HandshakeRequest),
    HandshakeAck(HandshakeResponse),
    /// Message header plus payload, still encoded
    Message(Bytes),
    Ping(u64),
    Pong(u64),
    /// Peer is closing deliberately
    Goodbye,
}

impl WireFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            WireFrame::Handshake(_) => FrameKind::Handshake,
            WireFrame::HandshakeAck(_) => FrameKind::HandshakeAck,
            WireFrame::Message(_) => FrameKind::Message,
            WireFrame::Ping(_) => FrameKind::Ping,
            WireFrame::Pong(_) => FrameKind::Pong,
            WireFrame::Goodbye => FrameKind::Goodbye,
        }
    }

    /// Encode including the length prefix, ready for a single socket write
    ///
    /// Fails when a string field is too long to be read back or the frame
    /// does not fit the `u32` length prefix.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut out = BytesMut::with_capacity(FRAME_LENGTH_PREFIX + 1 + self.body_hint());
        out.put_u32(0);
        out.put_u8(self.kind().into());
        match self {
            WireFrame::Handshake(request) => request.encode_body(&mut out)?,
            WireFrame::HandshakeAck(response) => response.encode_body(&mut out)?,
            WireFrame::Message(message) => out.put_slice(message),
            WireFrame::Ping(nonce) | WireFrame::Pong(nonce) => out.put_u64(*nonce),
            WireFrame::Goodbye => {}
        }
        let size = out.len() - FRAME_LENGTH_PREFIX;
        let length = u32::try_from(size).map_err(|_| ProtocolError::FrameTooLarge {
            size,
            max: u32::MAX as usize,
        })?;
        out[..FRAME_LENGTH_PREFIX].copy_from_slice(&length.to_be_bytes());
        Ok(out.freeze())
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn decode(mut frame: Bytes) -> ProtocolResult<Self> {
        let raw_kind = frame.read_u8("frame_kind")?;
        let kind = FrameKind::try_from(raw_kind)
            .map_err(|_| ProtocolError::UnknownFrameKind { kind: raw_kind })?;

        let decoded = match kind {
            FrameKind::Handshake => WireFrame::Handshake(HandshakeRequest::decode_body(&mut frame)?),
            FrameKind::HandshakeAck => WireFrame::HandshakeAck(HandshakeResponse::decode_body(&mut frame)?),
            FrameKind::Message => return Ok(WireFrame::Message(frame)),
            FrameKind::Ping => WireFrame::Ping(frame.read_u64("ping_nonce")?),
            FrameKind::Pong => WireFrame::Pong(frame.read_u64("pong_nonce")?),
            FrameKind::Goodbye => WireFrame::Goodbye,
        };

        if frame.has_remaining() {
            return Err(ProtocolError::invalid_field(
                "frame_body",
                format!("{} trailing bytes after {:?} frame", frame.remaining(), kind),
            ));
        }
        Ok(decoded)
    }

    fn body_hint(&self) -> usize {
        match self {
            WireFrame::Message(message) => message.len(),
            WireFrame::Ping(_) | WireFrame::Pong(_) => 8,
            WireFrame::Goodbye => 0,
            _ => 64,
        }
    }
}

/// Validate a length prefix read off the socket
pub fn frame_length(prefix: [u8; FRAME_LENGTH_PREFIX], max: usize) -> ProtocolResult<usize> {
    let size = u32::from_be_bytes(prefix) as usize;
    if size == 0 {
        return Err(ProtocolError::message_too_small(1, 0, "frame_kind"));
    }
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(size)
}

fn put_connection_id(out: &mut BytesMut, id: &ConnectionId) -> ProtocolResult<()> {
    out.put_i64(id.channel_id().to_long());
    out.write_string("jvm_id", id.jvm_id())?;
    out.write_string("server_id", id.server_id())?;
    out.put_u8(id.product().code());
    match id.credentials() {
        Some(credentials) => {
            out.write_bool(true);
            out.write_string("username", &credentials.username)?;
            out.write_string("password", &credentials.password)?;
        }
        None => out.write_bool(false),
    }
    Ok(())
}

fn get_connection_id(body: &mut Bytes) -> ProtocolResult<ConnectionId> {
    let channel_id = body.read_i64("channel_id")?;
    let jvm_id = body.read_string("jvm_id")?;
    let server_id = body.read_string("server_id")?;
    let raw_product = body.read_u8("product")?;
    let product = ProductId::from_code(raw_product)
        .map_err(|e| ProtocolError::invalid_field("product", e.to_string()))?;
    let id = ConnectionId::new(channel_id, jvm_id, server_id, product);
    if body.read_bool("has_credentials")? {
        let credentials = Credentials {
            username: body.read_string("username")?,
            password: body.read_string("password")?,
        };
        return Ok(id.with_credentials(credentials));
    }
    Ok(id)
}
