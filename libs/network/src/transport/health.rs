//! Connection Health Checker
//!
//! One background task per communications manager. Transports that have
//! been silent for longer than `ping_idle` are probed every `ping_interval`;
//! once `ping_probes` probes go unanswered the connection is dropped, which
//! surfaces as a transport disconnect on its channel. Any inbound frame
//! resets the probe count.

use super::Transport;
use crate::config::HealthCheckConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ConnectionHealthChecker {
    config: HealthCheckConfig,
    monitored: Mutex<Vec<Weak<dyn Transport>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ConnectionHealthChecker {
    pub fn new(config: HealthCheckConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            monitored: Mutex::new(Vec::new()),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Watch `transport` until it disconnects or is dropped
    pub fn monitor(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.monitored.lock().push(Arc::downgrade(transport));
        self.ensure_started();
    }

    pub fn monitored_count(&self) -> usize {
        self.monitored
            .lock()
            .iter()
            .filter(|t| t.upgrade().is_some_and(|t| t.is_connected()))
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop probing; idempotent
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Health checker stopped");
        }
        self.monitored.lock().clear();
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; connection health checking disabled");
            return;
        };
        let checker = Arc::downgrade(self);
        let period = self.config.ping_interval();
        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(checker) = checker.upgrade() else { break };
                checker.check_once();
            }
        }));
        debug!(interval_ms = self.config.ping_interval_ms, "Health checker started");
    }

    /// One probing round
    pub(crate) fn check_once(&self) {
        // collect first: dropping a connection fires channel events
        let live: Vec<Arc<dyn Transport>> = {
            let mut monitored = self.monitored.lock();
            monitored.retain(|t| t.upgrade().is_some_and(|t| t.is_connected()));
            monitored.iter().filter_map(Weak::upgrade).collect()
        };

        for transport in live {
            if transport.idle_for() < self.config.ping_idle() {
                continue;
            }
            if transport.outstanding_probes() >= self.config.ping_probes {
                warn!(
                    transport = transport.id(),
                    peer = %transport.remote_addr(),
                    probes = self.config.ping_probes,
                    "Peer stopped answering health probes; dropping connection"
                );
                transport.drop_connection();
            } else if let Err(e) = transport.send_probe() {
                debug!(transport = transport.id(), error = %e, "Failed to send health probe");
            }
        }
    }
}
