//! Message Router
//!
//! Dispatches parsed messages to the sink registered for their type, falling
//! back to a default sink. Lookups sit on every channel's receive path, so
//! routes live in a sharded concurrent map and can change at runtime without
//! stalling receivers.

use super::TcMessage;
use crate::error::RoutingError;
use comms_types::MessageType;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Terminus of a route
pub trait MessageSink: Send + Sync {
    /// Take ownership of a routed message
    ///
    /// Returning [`RoutingError::Unsupported`] tells the receive path the
    /// message was declined; the channel stays open.
    fn put_message(&self, message: TcMessage) -> Result<(), RoutingError>;
}

impl<F> MessageSink for F
where
    F: Fn(TcMessage) -> Result<(), RoutingError> + Send + Sync,
{
    fn put_message(&self, message: TcMessage) -> Result<(), RoutingError> {
        self(message)
    }
}

/// Router statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub defaulted: u64,
    pub unrouted: u64,
}

/// Type-keyed dispatch table with an optional default sink
#[derive(Default)]
pub struct MessageRouter {
    routes: DashMap<MessageType, Arc<dyn MessageSink>>,
    default_sink: RwLock<Option<Arc<dyn MessageSink>>>,
    routed: AtomicU64,
    defaulted: AtomicU64,
    unrouted: AtomicU64,
}

impl MessageRouter {
    /// Router without a default sink: unrouted types are fatal
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_sink(default_sink: Arc<dyn MessageSink>) -> Self {
        let router = Self::new();
        router.set_default_sink(Some(default_sink));
        router
    }

    /// Route `message_type` to `sink`, returning the sink it replaces
    pub fn route_message_type(
        &self,
        message_type: MessageType,
        sink: Arc<dyn MessageSink>,
    ) -> Option<Arc<dyn MessageSink>> {
        debug!(message_type = %message_type, "Routing message type");
        self.routes.insert(message_type, sink)
    }

    /// Remove the route for `message_type`; later messages use the default sink
    pub fn unroute_message_type(&self, message_type: MessageType) -> Option<Arc<dyn MessageSink>> {
        debug!(message_type = %message_type, "Unrouting message type");
        self.routes.remove(&message_type).map(|(_, sink)| sink)
    }

    pub fn set_default_sink(&self, sink: Option<Arc<dyn MessageSink>>) {
        *self.default_sink.write() = sink;
    }

    pub fn has_default_sink(&self) -> bool {
        self.default_sink.read().is_some()
    }

    pub fn is_routed(&self, message_type: MessageType) -> bool {
        self.routes.contains_key(&message_type)
    }

    /// Deliver `message` to its route, or the default sink
    ///
    /// The sink runs after the table entry is released, so sinks may change
    /// routes themselves.
    pub fn put_message(&self, message: TcMessage) -> Result<(), RoutingError> {
        let message_type = message.message_type();
        let routed = self.routes.get(&message_type).map(|entry| Arc::clone(entry.value()));
        if let Some(sink) = routed {
            self.routed.fetch_add(1, Ordering::Relaxed);
            trace!(message_type = %message_type, "Routed message");
            return sink.put_message(message);
        }

        let fallback = self.default_sink.read().clone();
        match fallback {
            Some(sink) => {
                self.defaulted.fetch_add(1, Ordering::Relaxed);
                sink.put_message(message)
            }
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                Err(RoutingError::NoRoute(message_type))
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            defaulted: self.defaulted.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<MessageType> = self.routes.iter().map(|e| *e.key()).collect();
        routes.sort();
        f.debug_struct("MessageRouter")
            .field("routes", &routes)
            .field("default_sink", &self.has_default_sink())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PingMessage, UnsupportedMessageSink};
    use crate::test_support::{detached_channel, inbound_message};
    use parking_lot::Mutex;

    /// Sink recording the types it received
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MessageType>>,
    }

    impl MessageSink for Recorder {
        fn put_message(&self, message: TcMessage) -> Result<(), RoutingError> {
            self.seen.lock().push(message.message_type());
            Ok(())
        }
    }

    #[test]
    fn test_routes_then_default_then_unroute() {
        let sink_a = Arc::new(Recorder::default());
        let sink_b = Arc::new(Recorder::default());
        let sink_d = Arc::new(Recorder::default());

        let router = MessageRouter::with_default_sink(sink_d.clone());
        router.route_message_type(MessageType::Ping, sink_a.clone());
        router.route_message_type(MessageType::Pong, sink_b.clone());

        let channel = detached_channel();
        router.put_message(inbound_message(&channel, MessageType::Ping, &PingMessage::new(1))).unwrap();
        router.put_message(inbound_message(&channel, MessageType::Jmx, &PingMessage::new(2))).unwrap();
        assert_eq!(*sink_a.seen.lock(), vec![MessageType::Ping]);
        assert!(sink_b.seen.lock().is_empty());
        assert_eq!(*sink_d.seen.lock(), vec![MessageType::Jmx]);

        assert!(router.unroute_message_type(MessageType::Ping).is_some());
        router.put_message(inbound_message(&channel, MessageType::Ping, &PingMessage::new(3))).unwrap();
        assert_eq!(sink_a.seen.lock().len(), 1);
        assert_eq!(*sink_d.seen.lock(), vec![MessageType::Jmx, MessageType::Ping]);

        assert_eq!(
            router.stats(),
            RouterStats {
                routed: 1,
                defaulted: 2,
                unrouted: 0
            }
        );
    }

    #[test]
    fn test_no_default_is_fatal() {
        let router = MessageRouter::new();
        let channel = detached_channel();
        let err = router
            .put_message(inbound_message(&channel, MessageType::Ping, &PingMessage::new(1)))
            .unwrap_err();
        assert_eq!(err, RoutingError::NoRoute(MessageType::Ping));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unsupported_default_is_recoverable() {
        let router = MessageRouter::with_default_sink(Arc::new(UnsupportedMessageSink));
        let channel = detached_channel();
        let err = router
            .put_message(inbound_message(&channel, MessageType::Bench, &PingMessage::new(1)))
            .unwrap_err();
        assert_eq!(err, RoutingError::Unsupported(MessageType::Bench));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_closure_sink_and_route_replacement() {
        let router = MessageRouter::new();
        let first: Arc<dyn MessageSink> = Arc::new(|_m: TcMessage| -> Result<(), RoutingError> { Ok(()) });
        assert!(router.route_message_type(MessageType::Ping, first).is_none());
        let replaced = router.route_message_type(MessageType::Ping, Arc::new(|_m: TcMessage| -> Result<(), RoutingError> { Ok(()) }));
        assert!(replaced.is_some());
        assert!(router.is_routed(MessageType::Ping));
    }

    #[test]
    fn test_sink_may_reroute_during_delivery() {
        let router = Arc::new(MessageRouter::new());
        let weak = Arc::downgrade(&router);
        router.route_message_type(
            MessageType::Ping,
            Arc::new(move |_m: TcMessage| -> Result<(), RoutingError> {
                if let Some(router) = weak.upgrade() {
                    router.unroute_message_type(MessageType::Ping);
                }
                Ok(())
            }),
        );
        let channel = detached_channel();
        router.put_message(inbound_message(&channel, MessageType::Ping, &PingMessage::new(1))).unwrap();
        assert!(!router.is_routed(MessageType::Ping));
    }
}
