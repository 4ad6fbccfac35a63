//! Application configuration
//!
//! Sectioned config with serde defaults, loadable from a JSON file.
//! Every section converts into the runtime config of the module it
//! describes, so a partial file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{ApiConfig, FetchKind};
use crate::channel::ChannelConfig;
use crate::signaling::RtcPeerConfig;
use crate::tasks::{TaskPollerConfig, TaskRefresh};
use crate::{ClientError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Telemetry channel settings
    pub channel: ChannelSection,
    /// HTTP pull API settings
    pub api: ApiSection,
    /// Media signaling settings
    pub signaling: SignalingSection,
    /// Analysis task settings
    pub tasks: TasksSection,
    /// Periodic fetch settings
    pub hub: HubSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel: ChannelSection::default(),
            api: ApiSection::default(),
            signaling: SignalingSection::default(),
            tasks: TasksSection::default(),
            hub: HubSection::default(),
        }
    }
}

/// Telemetry channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSection {
    /// Rig telemetry endpoint, e.g. ws://host:5000/ws
    pub url: String,
    /// Number of recent samples kept in memory
    pub sample_window: usize,
    /// Heartbeat ping interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Initial reconnect backoff in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect backoff cap in milliseconds
    pub reconnect_cap_ms: u64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        let defaults = ChannelConfig::default();
        Self {
            url: defaults.url,
            sample_window: defaults.sample_window,
            heartbeat_interval_ms: defaults.heartbeat_interval_ms,
            reconnect_base_ms: defaults.reconnect_base_ms,
            reconnect_cap_ms: defaults.reconnect_cap_ms,
        }
    }
}

/// Pull API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiSection {
    /// Rig HTTP base URL
    pub base_url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        let defaults = ApiConfig::default();
        Self {
            base_url: defaults.base_url,
            timeout_ms: defaults.timeout_ms,
        }
    }
}

/// Media signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingSection {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            stun_servers: RtcPeerConfig::default().stun_servers,
        }
    }
}

/// Analysis task configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TasksSection {
    /// Interval between status polls in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum total wait per job in milliseconds
    pub deadline_ms: u64,
    /// Re-submit interval in milliseconds; absent means one-shot
    pub refresh_interval_ms: Option<u64>,
}

impl Default for TasksSection {
    fn default() -> Self {
        let defaults = TaskPollerConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval_ms,
            deadline_ms: defaults.deadline_ms,
            refresh_interval_ms: None,
        }
    }
}

/// One configured periodic fetch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSubscription {
    /// Data kind to fetch
    pub kind: FetchKind,
    /// Fetch interval in milliseconds
    pub interval_ms: u64,
}

/// Periodic fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSection {
    /// Subscriptions started when the client opens
    pub subscriptions: Vec<HubSubscription>,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            subscriptions: vec![HubSubscription {
                kind: FetchKind::LedStats,
                interval_ms: 60_000,
            }],
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.channel.url.clone(),
            sample_window: self.channel.sample_window,
            heartbeat_interval_ms: self.channel.heartbeat_interval_ms,
            reconnect_base_ms: self.channel.reconnect_base_ms,
            reconnect_cap_ms: self.channel.reconnect_cap_ms,
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api.base_url.clone(),
            timeout_ms: self.api.timeout_ms,
        }
    }

    pub fn peer_config(&self) -> RtcPeerConfig {
        RtcPeerConfig {
            stun_servers: self.signaling.stun_servers.clone(),
        }
    }

    pub fn poller_config(&self) -> TaskPollerConfig {
        TaskPollerConfig {
            poll_interval_ms: self.tasks.poll_interval_ms,
            deadline_ms: self.tasks.deadline_ms,
            refresh: match self.tasks.refresh_interval_ms {
                Some(ms) => TaskRefresh::Every(Duration::from_millis(ms)),
                None => TaskRefresh::OneShot,
            },
        }
    }
}
