//! # Message Type Registry
//!
//! Closed set of wire type tags. Each tag has a stable numeric code and a
//! symbolic name; the code is what travels in the message header and what the
//! message factory dispatches on.
//!
//! ## Compatibility rule
//!
//! Codes are never reassigned. Retired codes stay listed in
//! [`RETIRED_CODES`] so a new type cannot silently reuse one (the
//! `test_no_retired_code_reused` unit test enforces it).

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! message_types {
    ( $( $(#[$meta:meta])* $variant:ident = $code:literal => $name:literal ),+ $(,)? ) => {
        /// Wire message type tag
        #[repr(u16)]
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            num_enum::TryFromPrimitive,
            num_enum::IntoPrimitive,
        )]
        pub enum MessageType {
            $( $(#[$meta])* $variant = $code, )+
        }

        impl MessageType {
            /// Every registered type in code order
            pub const ALL: &'static [MessageType] = &[ $( MessageType::$variant, )+ ];

            /// Symbolic name as it appears in logs and monitor dumps
            pub const fn name(&self) -> &'static str {
                match self {
                    $( MessageType::$variant => $name, )+
                }
            }
        }
    };
}

message_types! {
    Ping = 1 => "PING_MESSAGE",
    Pong = 2 => "PONG_MESSAGE",
    RequestRoot = 8 => "REQUEST_ROOT_MESSAGE",
    LockRequest = 9 => "LOCK_REQUEST_MESSAGE",
    CommitTransaction = 10 => "COMMIT_TRANSACTION_MESSAGE",
    RequestRootResponse = 11 => "REQUEST_ROOT_RESPONSE_MESSAGE",
    RequestManagedObject = 12 => "REQUEST_MANAGED_OBJECT_MESSAGE",
    RequestManagedObjectResponse = 13 => "REQUEST_MANAGED_OBJECT_RESPONSE_MESSAGE",
    BroadcastTransaction = 14 => "BROADCAST_TRANSACTION_MESSAGE",
    ObjectIdBatchRequest = 18 => "OBJECT_ID_BATCH_REQUEST_MESSAGE",
    ObjectIdBatchRequestResponse = 19 => "OBJECT_ID_BATCH_REQUEST_RESPONSE_MESSAGE",
    AcknowledgeTransaction = 24 => "ACKNOWLEDGE_TRANSACTION_MESSAGE",
    LockResponse = 26 => "LOCK_RESPONSE_MESSAGE",
    /// Application-level handshake a client sends once per connection
    ClientHandshake = 28 => "CLIENT_HANDSHAKE_MESSAGE",
    BatchTransactionAck = 29 => "BATCH_TRANSACTION_ACK_MESSAGE",
    ClientHandshakeAck = 30 => "CLIENT_HANDSHAKE_ACK_MESSAGE",
    ConfigPush = 31 => "CONFIG_PUSH_MESSAGE",
    OverrideApplicationConfig = 32 => "OVERRIDE_APPLICATION_CONFIG_MESSAGE",
    LockRecall = 33 => "LOCK_RECALL_MESSAGE",
    Jmx = 34 => "JMX_MESSAGE",
    LockQueryResponse = 35 => "LOCK_QUERY_RESPONSE_MESSAGE",
    JmxRemoteConnection = 36 => "JMXREMOTE_MESSAGE_CONNECTION_MESSAGE",
    MemoryDataStoreRequest = 37 => "MEMORY_DATA_STORE_REQUEST_MESSAGE",
    MemoryDataStoreResponse = 38 => "MEMORY_DATA_STORE_RESPONSE_MESSAGE",
    ClusterMembershipEvent = 39 => "CLUSTER_MEMBERSHIP_EVENT_MESSAGE",
    ClientJmxReady = 40 => "CLIENT_JMX_READY_MESSAGE",
    ObjectsNotFoundResponse = 41 => "OBJECTS_NOT_FOUND_RESPONSE_MESSAGE",
    Bench = 42 => "BENCH_MESSAGE",
    LockStat = 43 => "LOCK_STAT_MESSAGE",
    LockStatisticsResponse = 44 => "LOCK_STATISTICS_RESPONSE_MESSAGE",
    CompletedTransactionLowWatermark = 45 => "COMPLETED_TRANSACTION_LOWWATERMARK_MESSAGE",
    GroupWrapper = 46 => "GROUP_WRAPPER_MESSAGE",
    GroupHandshake = 47 => "GROUP_HANDSHAKE_MESSAGE",
    NodesWithObjects = 48 => "NODES_WITH_OBJECTS_MESSAGE",
    NodesWithObjectsResponse = 49 => "NODES_WITH_OBJECTS_RESPONSE_MESSAGE",
    KeysForOrphanedValues = 50 => "KEYS_FOR_ORPHANED_VALUES_MESSAGE",
    KeysForOrphanedValuesResponse = 51 => "KEYS_FOR_ORPHANED_VALUES_RESPONSE_MESSAGE",
    NodeMetaData = 52 => "NODE_META_DATA_MESSAGE",
    NodeMetaDataResponse = 53 => "NODE_META_DATA_RESPONSE_MESSAGE",
    StripeIdMap = 54 => "STRIPE_ID_MAP_MESSAGE",
    SyncWriteTransactionReceived = 55 => "SYNC_WRITE_TRANSACTION_RECEIVED_MESSAGE",
    GetValueServerMapRequest = 56 => "GET_VALUE_SERVER_MAP_REQUEST_MESSAGE",
    GetValueServerMapResponse = 57 => "GET_VALUE_SERVER_MAP_RESPONSE_MESSAGE",
    GetAllSizeServerMapRequest = 58 => "GET_ALL_SIZE_SERVER_MAP_REQUEST_MESSAGE",
    GetAllSizeServerMapResponse = 59 => "GET_ALL_SIZE_SERVER_MAP_RESPONSE_MESSAGE",
    TunneledDomainsChanged = 60 => "TUNNELED_DOMAINS_CHANGED_MESSAGE",
    ObjectNotFoundServerMapResponse = 61 => "OBJECT_NOT_FOUND_SERVER_MAP_RESPONSE_MESSAGE",
    EvictionServerMapBroadcast = 62 => "EVICTION_SERVER_MAP_BROADCAST_MESSAGE",
    GetAllKeysServerMapRequest = 63 => "GET_ALL_KEYS_SERVER_MAP_REQUEST_MESSAGE",
    GetAllKeysServerMapResponse = 64 => "GET_ALL_KEYS_SERVER_MAP_RESPONSE_MESSAGE",
    SearchQueryRequest = 65 => "SEARCH_QUERY_REQUEST_MESSAGE",
    SearchQueryResponse = 66 => "SEARCH_QUERY_RESPONSE_MESSAGE",
    NodesWithKeys = 67 => "NODES_WITH_KEYS_MESSAGE",
    NodesWithKeysResponse = 68 => "NODES_WITH_KEYS_RESPONSE_MESSAGE",
    InvalidateObjects = 69 => "INVALIDATE_OBJECTS_MESSAGE",
    ClientHandshakeRefused = 70 => "CLIENT_HANDSHAKE_REFUSED_MESSAGE",
}

/// Codes that belonged to types removed from the protocol
pub const RETIRED_CODES: &[u16] = &[3, 4, 5, 6, 7, 15, 16, 17, 20, 21, 22, 23, 25, 27];

impl MessageType {
    /// Resolve a wire code
    pub fn from_code(code: u16) -> Result<Self, ValidationError> {
        Self::try_from(code).map_err(|_| ValidationError::UnknownMessageType { code })
    }

    /// Stable wire code
    #[inline(always)]
    pub fn code(&self) -> u16 {
        (*self).into()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_unique_and_resolvable() {
        let mut seen = HashSet::new();
        for t in MessageType::ALL {
            assert!(seen.insert(t.code()), "duplicate code {}", t.code());
            assert_eq!(MessageType::from_code(t.code()).unwrap(), *t);
        }
    }

    #[test]
    fn test_no_retired_code_reused() {
        for code in RETIRED_CODES {
            assert!(MessageType::from_code(*code).is_err(), "retired code {} reused", code);
        }
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(MessageType::Ping.code(), 1);
        assert_eq!(MessageType::Pong.code(), 2);
        assert_eq!(MessageType::ClientHandshake.code(), 28);
        assert_eq!(MessageType::ClientHandshakeAck.code(), 30);
        assert_eq!(MessageType::ClientHandshakeRefused.code(), 70);
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(
            MessageType::from_code(999),
            Err(ValidationError::UnknownMessageType { code: 999 })
        );
    }

    #[test]
    fn test_display_uses_symbolic_name() {
        assert_eq!(MessageType::Ping.to_string(), "PING_MESSAGE (1)");
    }

    proptest::proptest! {
        #[test]
        fn prop_from_code_round_trips_only_registered(code in 0u16..512) {
            match MessageType::from_code(code) {
                Ok(t) => proptest::prop_assert_eq!(t.code(), code),
                Err(e) => proptest::prop_assert_eq!(e, ValidationError::UnknownMessageType { code }),
            }
        }
    }
}
