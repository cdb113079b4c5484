//! Validation errors for identifiers and registry lookups

use thiserror::Error;

/// Errors raised while constructing identifiers or resolving wire codes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier carries the null sentinel where a real id is required
    #[error("{kind} cannot be the null id")]
    NullId { kind: &'static str },

    /// Identifier value is negative (reserved for sentinels)
    #[error("{kind} value {value} is negative; only the null sentinel may be negative")]
    Negative { kind: &'static str, value: i64 },

    /// Numeric code does not map to a registered message type
    #[error("unknown message type code {code}")]
    UnknownMessageType { code: u16 },

    /// Numeric code does not map to a product id
    #[error("unknown product id code {code}")]
    UnknownProduct { code: u8 },
}
