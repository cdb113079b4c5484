//! Communications Error Types
//!
//! One taxonomy for everything a channel, listener or manager can report.
//! Callers of `open`/`send` get these directly; the receive path only logs
//! them and closes the affected channel.

use comms_codec::ProtocolError;
use comms_types::{MessageType, ValidationError};
use thiserror::Error;

/// Main communications error type
#[derive(Error, Debug)]
pub enum CommsError {
    /// Handshake, connect or listener stop did not finish in time
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Address could not be resolved
    #[error("Unknown host: {host}")]
    UnknownHost {
        host: String,
        source: Option<std::io::Error>,
    },

    /// Socket level failure
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// Server refused the connection because its client limit is reached
    #[error("Max connections exceeded: {detail}")]
    MaxConnectionsExceeded { detail: String },

    /// Peers speak different transport stack versions
    #[error("Protocol stack mismatch: {detail}")]
    StackMismatch { detail: String },

    /// Server does not know the connection a client tried to resume
    #[error("Reconnection rejected: {detail}")]
    ReconnectionRejected { detail: String },

    /// Server refused the handshake for another reason (e.g. credentials)
    #[error("Connection rejected: {detail}")]
    Rejected { detail: String },

    /// Wire decoding failure; fatal to the connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message could not be dispatched
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Operation not permitted in the channel's current state or role
    #[error("Illegal state: {operation}: {reason}")]
    IllegalState {
        operation: &'static str,
        reason: String,
    },

    /// Wiring or configuration defect
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// No factory mapping for the type in the required direction
    #[error("No message mapping for {message_type} ({direction})")]
    UnmappedMessageType {
        message_type: MessageType,
        direction: &'static str,
    },

    /// A mapping for this type is already registered
    #[error("Duplicate message mapping for {0}")]
    DuplicateMapping(MessageType),

    /// Channel is closed or has no live transport
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    /// Communications manager has been shut down
    #[error("Communications manager is shut down")]
    Shutdown,
}

/// Result type alias for communications operations
pub type Result<T> = std::result::Result<T, CommsError>;

/// Outcome of a failed dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// A sink declined the message; the channel survives
    #[error("Unsupported message type {0}")]
    Unsupported(MessageType),

    /// No route and no default sink; the connection cannot continue
    #[error("No route and no default sink for {0}")]
    NoRoute(MessageType),
}

impl RoutingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RoutingError::NoRoute(_))
    }
}

impl CommsError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an I/O error keeping the underlying source
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn unknown_host(host: impl Into<String>, source: Option<std::io::Error>) -> Self {
        Self::UnknownHost {
            host: host.into(),
            source,
        }
    }

    pub fn illegal_state(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::IllegalState {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn channel_closed(channel: impl std::fmt::Display) -> Self {
        Self::ChannelClosed {
            channel: channel.to_string(),
        }
    }

    /// Whether a caller may reasonably retry (another address, later, after backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            CommsError::Timeout { .. } => true,
            CommsError::UnknownHost { .. } => true,
            CommsError::Io { .. } => true,
            CommsError::MaxConnectionsExceeded { .. } => true,
            CommsError::ReconnectionRejected { .. } => true,
            CommsError::ChannelClosed { .. } => true,
            CommsError::Routing(e) => !e.is_fatal(),
            CommsError::Rejected { .. } => false,
            CommsError::StackMismatch { .. } => false,
            CommsError::Protocol(_) => false,
            CommsError::IllegalState { .. } => false,
            CommsError::Configuration { .. } => false,
            CommsError::UnmappedMessageType { .. } => false,
            CommsError::DuplicateMapping(_) => false,
            CommsError::Shutdown => false,
        }
    }

    /// Whether this error means the peer can no longer be trusted
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            CommsError::Protocol(_) | CommsError::StackMismatch { .. } | CommsError::UnmappedMessageType { .. }
        ) || matches!(self, CommsError::Routing(e) if e.is_fatal())
    }

    /// Error category for logs and state dumps
    pub fn category(&self) -> &'static str {
        match self {
            CommsError::Timeout { .. } => "timeout",
            CommsError::UnknownHost { .. } => "unknown_host",
            CommsError::Io { .. } => "io",
            CommsError::MaxConnectionsExceeded { .. } => "max_connections",
            CommsError::StackMismatch { .. } => "stack_mismatch",
            CommsError::ReconnectionRejected { .. } => "reconnection_rejected",
            CommsError::Rejected { .. } => "rejected",
            CommsError::Protocol(_) => "protocol",
            CommsError::Routing(_) => "routing",
            CommsError::IllegalState { .. } => "illegal_state",
            CommsError::Configuration { .. } => "configuration",
            CommsError::UnmappedMessageType { .. } => "unmapped_message_type",
            CommsError::DuplicateMapping(_) => "duplicate_mapping",
            CommsError::ChannelClosed { .. } => "channel_closed",
            CommsError::Shutdown => "shutdown",
        }
    }
}

/// Convert standard I/O errors to communications errors
impl From<std::io::Error> for CommsError {
    fn from(error: std::io::Error) -> Self {
        CommsError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<ValidationError> for CommsError {
    fn from(error: ValidationError) -> Self {
        CommsError::configuration(error.to_string(), None)
    }
}

impl From<toml::de::Error> for CommsError {
    fn from(error: toml::de::Error) -> Self {
        CommsError::configuration(format!("TOML configuration error: {}", error), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert_eq!(CommsError::timeout("handshake", 500).category(), "timeout");
        assert_eq!(CommsError::DuplicateMapping(MessageType::Ping).category(), "duplicate_mapping");
        assert_eq!(CommsError::Shutdown.category(), "shutdown");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(CommsError::timeout("open", 1000).is_recoverable());
        assert!(CommsError::MaxConnectionsExceeded { detail: "2 of 2".into() }.is_recoverable());
        assert!(CommsError::unknown_host("nowhere.invalid", None).is_recoverable());
        assert!(!CommsError::DuplicateMapping(MessageType::Ping).is_recoverable());
        assert!(!CommsError::StackMismatch { detail: "3 vs 4".into() }.is_recoverable());
        assert!(!CommsError::illegal_state("open", "already open").is_recoverable());
    }

    #[test]
    fn test_routing_miss_is_recoverable_but_no_route_is_fatal() {
        let miss = CommsError::from(RoutingError::Unsupported(MessageType::Jmx));
        let none = CommsError::from(RoutingError::NoRoute(MessageType::Jmx));
        assert!(miss.is_recoverable());
        assert!(!miss.is_fatal_to_connection());
        assert!(!none.is_recoverable());
        assert!(none.is_fatal_to_connection());
    }

    #[test]
    fn test_protocol_error_is_fatal() {
        let err = CommsError::from(ProtocolError::UnknownMessageType { code: 900 });
        assert!(err.is_fatal_to_connection());
        assert!(err.to_string().contains("900"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        match CommsError::from(io_err) {
            CommsError::Io { message, .. } => assert!(message.contains("refused")),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }
}
