//! Message Monitor
//!
//! Per-type traffic counters. Every channel reports each message it sends or
//! receives; [`NullMessageMonitor`] turns that into an inlined no-op when
//! monitoring is disabled.

use comms_types::MessageType;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Observer of channel traffic
pub trait MessageMonitor: Send + Sync {
    fn new_incoming_message(&self, message_type: MessageType, bytes: usize);

    fn new_outgoing_message(&self, message_type: MessageType, bytes: usize);

    /// Release background resources
    fn shutdown(&self) {}
}

/// Monitor that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMessageMonitor;

impl MessageMonitor for NullMessageMonitor {
    #[inline(always)]
    fn new_incoming_message(&self, _message_type: MessageType, _bytes: usize) {}

    #[inline(always)]
    fn new_outgoing_message(&self, _message_type: MessageType, _bytes: usize) {}
}

#[derive(Debug, Default)]
struct Counters {
    incoming_count: AtomicU64,
    incoming_bytes: AtomicU64,
    outgoing_count: AtomicU64,
    outgoing_bytes: AtomicU64,
}

/// Point-in-time counters for one message type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorCounts {
    pub incoming_count: u64,
    pub incoming_bytes: u64,
    pub outgoing_count: u64,
    pub outgoing_bytes: u64,
}

/// Lock-free per-type counters with an optional periodic info dump
#[derive(Debug, Default)]
pub struct MessageMonitorImpl {
    counters: DashMap<MessageType, Arc<Counters>>,
    dump_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageMonitorImpl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start logging the counters every `interval`; needs a tokio runtime
    pub fn start_periodic_dump(self: &Arc<Self>, interval: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; message monitor dump disabled");
            return;
        };
        let monitor = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else { break };
                monitor.log_counts();
            }
        });
        if let Some(previous) = self.dump_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn snapshot(&self) -> BTreeMap<MessageType, MonitorCounts> {
        self.counters
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    *entry.key(),
                    MonitorCounts {
                        incoming_count: c.incoming_count.load(Ordering::Relaxed),
                        incoming_bytes: c.incoming_bytes.load(Ordering::Relaxed),
                        outgoing_count: c.outgoing_count.load(Ordering::Relaxed),
                        outgoing_bytes: c.outgoing_bytes.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    pub fn counts(&self, message_type: MessageType) -> MonitorCounts {
        self.snapshot().remove(&message_type).unwrap_or_default()
    }

    fn log_counts(&self) {
        for (message_type, counts) in self.snapshot() {
            info!(
                message_type = %message_type,
                incoming = counts.incoming_count,
                incoming_bytes = counts.incoming_bytes,
                outgoing = counts.outgoing_count,
                outgoing_bytes = counts.outgoing_bytes,
                "Message traffic"
            );
        }
    }

    #[inline]
    fn counters_for(&self, message_type: MessageType) -> Arc<Counters> {
        if let Some(existing) = self.counters.get(&message_type) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.counters.entry(message_type).or_default().value())
    }
}

impl MessageMonitor for MessageMonitorImpl {
    fn new_incoming_message(&self, message_type: MessageType, bytes: usize) {
        let c = self.counters_for(message_type);
        c.incoming_count.fetch_add(1, Ordering::Relaxed);
        c.incoming_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn new_outgoing_message(&self, message_type: MessageType, bytes: usize) {
        let c = self.counters_for(message_type);
        c.outgoing_count.fetch_add(1, Ordering::Relaxed);
        c.outgoing_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn shutdown(&self) {
        if let Some(task) = self.dump_task.lock().take() {
            task.abort();
        }
    }
}
