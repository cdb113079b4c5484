//! # Communications Codec
//!
//! Byte-level rules shared by both ends of a connection:
//!
//! - [`MessageHeader`]: the fixed 12-byte header in front of every typed
//!   message, including the self-declared length check
//! - [`WireFrame`]: length-prefixed transport frames (handshake, message,
//!   health probes, goodbye)
//! - [`WireRead`] / [`WireWrite`]: bounds-checked big-endian primitives used
//!   by message bodies
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → libs/network
//!     ↑           ↓            ↓
//!  Ids and     Headers      Channels,
//!  type codes  and frames   sockets
//! ```
//!
//! Nothing here touches a socket or spawns a task.

pub mod constants;
pub mod error;
pub mod frame;
pub mod header;
pub mod wire;

pub use constants::{
    DEFAULT_MAX_FRAME_SIZE, FRAME_LENGTH_PREFIX, HEADER_LENGTH, HEADER_LENGTH_WORDS, HEADER_VERSION,
    STACK_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{frame_length, FrameKind, HandshakeRequest, HandshakeResponse, HandshakeStatus, WireFrame};
pub use header::MessageHeader;
pub use wire::{WireRead, WireWrite};
