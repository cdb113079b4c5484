//! Protocol-level errors for frame and header decoding
//!
//! Every variant here means the peer sent bytes this stack cannot trust. The
//! channel layer treats them as fatal to the connection.

use thiserror::Error;

/// Wire decoding errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is too small to contain the expected structure
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Header declares a length different from the compiled-in constant
    #[error("Bad header length: declared {declared} bytes, expected {expected} (frame head: {preview})")]
    BadHeaderLength {
        declared: usize,
        expected: usize,
        preview: String,
    },

    /// Header version is not spoken by this stack
    #[error("Unsupported header version {version}: supported version is {supported}")]
    UnsupportedVersion { version: u8, supported: u8 },

    /// Numeric message type has no registered `MessageType`
    #[error("Unknown message type code {code}")]
    UnknownMessageType { code: u16 },

    /// Header payload length disagrees with the bytes actually present
    #[error("Payload length mismatch: header declares {declared} bytes, frame carries {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    /// Transport frame kind byte is not recognised
    #[error("Unknown frame kind {kind:#04x}")]
    UnknownFrameKind { kind: u8 },

    /// Frame exceeds the configured maximum
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// A length-prefixed string is not valid UTF-8 or is too long
    #[error("Invalid string field '{field}': {reason}")]
    InvalidString { field: &'static str, reason: String },

    /// A field carries a value outside its domain
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Message body could not be decoded into its typed form
    #[error("Body decode failed for {message_type}: {reason}")]
    BodyDecode { message_type: String, reason: String },
}

impl ProtocolError {
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    /// Header length mismatch, keeping a short hex dump of the offending bytes
    pub fn bad_header_length(declared: usize, expected: usize, frame: &[u8]) -> Self {
        let end = frame.len().min(16);
        Self::BadHeaderLength {
            declared,
            expected,
            preview: hex::encode(&frame[..end]),
        }
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn body_decode(message_type: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::BodyDecode {
            message_type: message_type.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for codec operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
