//! # Wire Constants
//!
//! Values both ends of a connection must agree on. Changing any of them is a
//! wire-format break and requires bumping [`STACK_VERSION`].

/// Version of the transport + message stack; a mismatch fails the handshake
pub const STACK_VERSION: u16 = 4;

/// Current message header version
pub const HEADER_VERSION: u8 = 2;

/// Fixed byte length of every message header
pub const HEADER_LENGTH: usize = 12;

/// Header length as declared on the wire (in 4-byte words)
pub const HEADER_LENGTH_WORDS: u8 = (HEADER_LENGTH / 4) as u8;

/// Width of the big-endian length prefix in front of every transport frame
pub const FRAME_LENGTH_PREFIX: usize = 4;

/// Default upper bound for a single transport frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Longest string accepted in handshake fields
pub const MAX_HANDSHAKE_STRING: usize = 4096;
