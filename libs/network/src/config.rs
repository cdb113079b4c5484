//! Communications Configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty document is a
//! valid configuration. Durations are stored as milliseconds and exposed as
//! [`Duration`] through accessors.
//!
//! ```toml
//! name = "l2-east"
//! max_connections = 64
//!
//! [tcp]
//! handshake_timeout_ms = 5000
//!
//! [health_check]
//! enabled = true
//! ping_idle_ms = 5000
//!
//! [listener]
//! reconnect_window_ms = 30000
//! ```

use crate::error::{CommsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration owned by one communications manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// Name used in logs and as the server id of listeners
    pub name: String,
    /// Distinct client processes a listener admits; `None` means unlimited
    pub max_connections: Option<usize>,
    pub tcp: TcpConfig,
    pub health_check: HealthCheckConfig,
    pub reconnect: ReconnectConfig,
    pub monitor: MonitorConfig,
    pub listener: ListenerConfig,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            name: "comms".to_string(),
            max_connections: None,
            tcp: TcpConfig::default(),
            health_check: HealthCheckConfig::default(),
            reconnect: ReconnectConfig::default(),
            monitor: MonitorConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

/// TCP transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Upper bound for a client's connect plus handshake when no per-channel timeout is given
    pub connect_timeout_ms: u64,
    /// Time a server waits for the first handshake frame of an accepted socket
    pub handshake_timeout_ms: u64,
    pub max_frame_size: usize,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            max_frame_size: comms_codec::DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
        }
    }
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Connection health checking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Silence after which a transport starts being probed
    pub ping_idle_ms: u64,
    /// Spacing between probes
    pub ping_interval_ms: u64,
    /// Unanswered probes tolerated before the transport is dropped
    pub ping_probes: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ping_idle_ms: 5_000,
            ping_interval_ms: 1_000,
            ping_probes: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn ping_idle(&self) -> Duration {
        Duration::from_millis(self.ping_idle_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Automatic client reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// 0 means retry until the channel is closed
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Message monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Period of the counter dump at info level; 0 disables the dump
    pub log_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_interval_ms: 0,
        }
    }
}

impl MonitorConfig {
    pub fn log_interval(&self) -> Option<Duration> {
        (self.log_interval_ms > 0).then(|| Duration::from_millis(self.log_interval_ms))
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Stop timeout used by manager shutdown
    pub stop_timeout_ms: u64,
    /// How long a server channel kept after a disconnect waits for its
    /// client to reconnect; 0 waits until the channel is closed explicitly
    pub reconnect_window_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5_000,
            reconnect_window_ms: 60_000,
        }
    }
}

impl ListenerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn reconnect_window(&self) -> Option<Duration> {
        (self.reconnect_window_ms > 0).then(|| Duration::from_millis(self.reconnect_window_ms))
    }
}

impl CommsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: CommsConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CommsError::io(format!("Failed to read config {}", path.display()), e))?;
        debug!(path = %path.display(), "Loading communications config");
        Self::from_toml_str(&raw)
    }

    /// Reject settings that would make the stack hang or refuse every frame
    pub fn validate(&self) -> Result<()> {
        if self.tcp.connect_timeout_ms == 0 {
            return Err(CommsError::configuration("connect timeout must be positive", Some("tcp.connect_timeout_ms")));
        }
        if self.tcp.handshake_timeout_ms == 0 {
            return Err(CommsError::configuration(
                "handshake timeout must be positive",
                Some("tcp.handshake_timeout_ms"),
            ));
        }
        if self.tcp.max_frame_size == 0 {
            return Err(CommsError::configuration("max frame size must be positive", Some("tcp.max_frame_size")));
        }
        if self.health_check.enabled {
            if self.health_check.ping_interval_ms == 0 {
                return Err(CommsError::configuration(
                    "ping interval must be positive",
                    Some("health_check.ping_interval_ms"),
                ));
            }
            if self.health_check.ping_probes == 0 {
                return Err(CommsError::configuration(
                    "at least one probe is required",
                    Some("health_check.ping_probes"),
                ));
            }
        }
        if self.reconnect.enabled && self.reconnect.interval_ms == 0 {
            return Err(CommsError::configuration(
                "reconnect interval must be positive",
                Some("reconnect.interval_ms"),
            ));
        }
        if self.listener.stop_timeout_ms == 0 {
            return Err(CommsError::configuration(
                "stop timeout must be positive",
                Some("listener.stop_timeout_ms"),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(CommsError::configuration("max connections must be positive", Some("max_connections")));
        }
        Ok(())
    }
}
