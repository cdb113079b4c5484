//! # Channel and Node Identifiers
//!
//! Lightweight value types naming channels, cluster participants, connections
//! and connection sessions.
//!
//! Long-valued ids (`ChannelId`, `ClientId`, `SessionId`) share one shape,
//! generated by [`define_long_id!`]: a transparent `i64` wrapper where every
//! non-negative value is valid and `-1` is the distinguished `NULL` sentinel.
//!
//! ```rust
//! use comms_types::{ChannelId, ClientId, NodeId};
//!
//! let channel = ChannelId::new(7).unwrap();
//! let client = ClientId::from(channel);
//! assert_eq!(NodeId::Client(client).to_string(), "ClientID[7]");
//! assert!(ChannelId::NULL.is_null());
//! ```

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generates a non-negative `i64` identifier with a `NULL` sentinel of `-1`
#[macro_export]
macro_rules! define_long_id {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal
    ) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Sentinel for "no id assigned"
            pub const NULL: Self = Self(-1);

            /// Create a validated id; negative values are rejected
            #[inline]
            pub fn new(value: i64) -> Result<Self, $crate::errors::ValidationError> {
                if value < 0 {
                    return Err($crate::errors::ValidationError::Negative {
                        kind: stringify!($name),
                        value,
                    });
                }
                Ok(Self(value))
            }

            /// Wrap a raw value without validation (wire decoding, sentinels)
            #[inline(always)]
            pub const fn from_raw(value: i64) -> Self {
                Self(value)
            }

            /// Underlying integer
            #[inline(always)]
            pub const fn to_long(&self) -> i64 {
                self.0
            }

            /// True for the `NULL` sentinel (or any negative raw value)
            #[inline(always)]
            pub const fn is_null(&self) -> bool {
                self.0 < 0
            }

            /// Reject the sentinel where a real id is required
            pub fn non_null(self) -> Result<Self, $crate::errors::ValidationError> {
                if self.is_null() {
                    return Err($crate::errors::ValidationError::NullId {
                        kind: stringify!($name),
                    });
                }
                Ok(self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_null() {
                    write!(f, "{}[NULL]", $label)
                } else {
                    write!(f, "{}[{}]", $label, self.0)
                }
            }
        }
    };
}

define_long_id! {
    /// Identifies one logical channel on a node
    ChannelId, "ChannelID"
}

define_long_id! {
    /// Identifies a client participant; derived from the channel id the server assigned
    ClientId, "ClientID"
}

define_long_id! {
    /// Generation counter of a connection's lifetime
    ///
    /// Advances on every transport disconnect/reconnect so stale in-flight
    /// messages can be recognised. Purely informational in this stack.
    SessionId, "SessionID"
}

impl From<ChannelId> for ClientId {
    fn from(id: ChannelId) -> Self {
        ClientId(id.0)
    }
}

impl From<ClientId> for ChannelId {
    fn from(id: ClientId) -> Self {
        ChannelId(id.0)
    }
}

impl SessionId {
    /// First session handed out by a fresh provider
    pub const FIRST: Self = Self(0);

    /// The session following this one
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1).max(0))
    }
}

/// Identifies a server participant by name and a process-unique id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    name: String,
    uid: Uuid,
}

impl ServerId {
    /// Create a server id with a fresh random uid
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
        }
    }

    /// Create a server id from known parts (wire decoding)
    pub fn from_parts(name: impl Into<String>, uid: Uuid) -> Self {
        Self {
            name: name.into(),
            uid,
        }
    }

    /// The null server id
    pub fn null() -> Self {
        Self {
            name: String::new(),
            uid: Uuid::nil(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn is_null(&self) -> bool {
        self.uid.is_nil() && self.name.is_empty()
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ServerID[NULL]")
        } else {
            write!(f, "ServerID[{}:{}]", self.name, self.uid)
        }
    }
}

/// A cluster participant: either a client or a server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    Client(ClientId),
    Server(ServerId),
}

impl NodeId {
    /// Null client node (the usual "not yet known" value)
    pub const NULL_CLIENT: NodeId = NodeId::Client(ClientId::NULL);

    pub fn is_null(&self) -> bool {
        match self {
            NodeId::Client(id) => id.is_null(),
            NodeId::Server(id) => id.is_null(),
        }
    }

    pub fn as_client(&self) -> Option<ClientId> {
        match self {
            NodeId::Client(id) => Some(*id),
            NodeId::Server(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerId> {
        match self {
            NodeId::Server(id) => Some(id),
            NodeId::Client(_) => None,
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::NULL_CLIENT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Client(id) => id.fmt(f),
            NodeId::Server(id) => id.fmt(f),
        }
    }
}

impl From<ClientId> for NodeId {
    fn from(id: ClientId) -> Self {
        NodeId::Client(id)
    }
}

impl From<ServerId> for NodeId {
    fn from(id: ServerId) -> Self {
        NodeId::Server(id)
    }
}

/// Kind of client behind a connection
///
/// Codes are part of the transport handshake and must stay stable.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
)]
pub enum ProductId {
    /// Regular long-lived client
    Stripe = 0,
    /// Server-to-server link
    Server = 1,
    /// Client that survives server failover
    Permanent = 2,
    /// Tooling connection; never reconnects
    Diagnostic = 3,
    /// Short informational query; never reconnects
    Informational = 4,
    /// Discovery probe; never reconnects
    Discovery = 5,
}

impl ProductId {
    /// Whether channels of this product should transparently reconnect
    pub fn is_reconnect_enabled(&self) -> bool {
        matches!(self, ProductId::Stripe | ProductId::Server | ProductId::Permanent)
    }

    /// Internal products do not count against connection limits
    pub fn is_internal(&self) -> bool {
        matches!(self, ProductId::Server | ProductId::Diagnostic | ProductId::Discovery)
    }

    pub fn from_code(code: u8) -> Result<Self, ValidationError> {
        Self::try_from(code).map_err(|_| ValidationError::UnknownProduct { code })
    }

    pub fn code(&self) -> u8 {
        (*self).into()
    }
}

/// Credentials presented on connect
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity negotiated by the transport handshake
///
/// Carries the numeric channel id the server allocated, the client process
/// id, the allocating server's id string, the product tag and optional
/// credentials. `ConnectionId::null()` until a transport has connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    channel_id: i64,
    jvm_id: String,
    server_id: String,
    product: ProductId,
    credentials: Option<Credentials>,
}

impl ConnectionId {
    pub fn new(channel_id: i64, jvm_id: impl Into<String>, server_id: impl Into<String>, product: ProductId) -> Self {
        Self {
            channel_id,
            jvm_id: jvm_id.into(),
            server_id: server_id.into(),
            product,
            credentials: None,
        }
    }

    /// The not-yet-connected id
    pub fn null() -> Self {
        Self::new(-1, "", "", ProductId::Stripe)
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Same identity re-stamped with a different allocated channel id
    pub fn with_channel_id(mut self, channel_id: i64) -> Self {
        self.channel_id = channel_id;
        self
    }

    /// Same identity re-stamped by another server
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId::from_raw(self.channel_id)
    }

    pub fn client_id(&self) -> ClientId {
        ClientId::from_raw(self.channel_id)
    }

    pub fn jvm_id(&self) -> &str {
        &self.jvm_id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn product(&self) -> ProductId {
        self.product
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.channel_id < 0
    }

    /// A connection id that carries an allocated channel
    pub fn is_valid(&self) -> bool {
        !self.is_null()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionID({}.{}.{}.{:?})",
            self.channel_id, self.jvm_id, self.server_id, self.product
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_null_sentinel() {
        assert!(ChannelId::NULL.is_null());
        assert_eq!(ChannelId::default(), ChannelId::NULL);
        assert_eq!(ChannelId::NULL.to_string(), "ChannelID[NULL]");
        assert!(ChannelId::new(-5).is_err());
        assert!(!ChannelId::new(0).unwrap().is_null());
    }

    #[test]
    fn test_channel_id_ordering_follows_integer() {
        let a = ChannelId::new(3).unwrap();
        let b = ChannelId::new(11).unwrap();
        assert!(a < b);
        assert!(ChannelId::NULL < a);
    }

    #[test]
    fn test_client_id_derives_from_channel() {
        let channel = ChannelId::new(42).unwrap();
        let client = ClientId::from(channel);
        assert_eq!(client.to_long(), 42);
        assert_eq!(ChannelId::from(client), channel);
    }

    #[test]
    fn test_session_id_strictly_increases() {
        let s0 = SessionId::FIRST;
        let s1 = s0.next();
        let s2 = s1.next();
        assert!(s0 < s1 && s1 < s2);
        assert_eq!(SessionId::NULL.next(), SessionId::FIRST);
    }

    #[test]
    fn test_node_id_null_per_variant() {
        assert!(NodeId::NULL_CLIENT.is_null());
        assert!(NodeId::Server(ServerId::null()).is_null());
        let server = ServerId::generate("l2-a");
        assert!(!NodeId::from(server.clone()).is_null());
        assert_eq!(NodeId::from(server.clone()).as_server(), Some(&server));
    }

    #[test]
    fn test_connection_id_lifecycle() {
        let null = ConnectionId::null();
        assert!(null.is_null());
        assert!(null.channel_id().is_null());

        let id = ConnectionId::new(9, "pid-1", "server-a", ProductId::Stripe);
        assert!(id.is_valid());
        assert_eq!(id.client_id(), ClientId::new(9).unwrap());
        assert_eq!(id.clone().with_channel_id(12).channel_id().to_long(), 12);
    }

    #[test]
    fn test_credentials_redacted_in_debug() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_product_codes_stable() {
        assert_eq!(ProductId::Stripe.code(), 0);
        assert_eq!(ProductId::Discovery.code(), 5);
        assert_eq!(ProductId::from_code(2).unwrap(), ProductId::Permanent);
        assert!(ProductId::from_code(99).is_err());
        assert!(ProductId::Stripe.is_reconnect_enabled());
        assert!(!ProductId::Diagnostic.is_reconnect_enabled());
    }
}
