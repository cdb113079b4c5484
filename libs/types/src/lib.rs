//! # Communications Types
//!
//! Value vocabulary shared by the codec and the channel layer:
//!
//! - **Identifiers**: [`ChannelId`], [`ClientId`], [`ServerId`], [`NodeId`],
//!   [`SessionId`] and the transport-negotiated [`ConnectionId`]
//! - **Message types**: the closed [`MessageType`] registry with stable wire codes
//! - **Products**: [`ProductId`] tags describing what kind of client connected
//!
//! Nothing here performs I/O; every type is a cheap, immutable value.

pub mod errors;
pub mod identifiers;
pub mod message_type;

pub use errors::ValidationError;
pub use identifiers::{
    ChannelId, ClientId, ConnectionId, Credentials, NodeId, ProductId, ServerId, SessionId,
};
pub use message_type::{MessageType, RETIRED_CODES};
