//! Agent configuration. Passed explicitly to every component; nothing reads it globally.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Data directory (mirror database)
    pub data_dir: PathBuf,
    /// Devices to connect to at startup
    pub devices: Vec<String>,
    /// Port forwarding and agent client settings
    pub transport: TransportConfig,
    /// Poll cadences and failure tolerance
    pub polling: PollingConfig,
    /// Which domain pollers run for monitored processes
    pub domains: DomainsConfig,
    /// Heavy payload retrieval
    pub payload: PayloadConfig,
    /// Memory domain options
    pub memory: MemoryConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Host the forwarded port is reachable on
    pub host: String,
    /// Program that sets up a port forward (e.g. "adb")
    pub forward_program: String,
    /// Arguments; `{device}`, `{port}` and `{socket}` are substituted
    pub forward_args: Vec<String>,
    /// Arguments to remove a forward; same substitutions
    pub remove_args: Vec<String>,
    /// Name of the agent's socket on the device
    pub device_socket: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub discovery_interval_ms: u64,
    pub cpu_interval_ms: u64,
    pub memory_interval_ms: u64,
    pub network_interval_ms: u64,
    pub event_interval_ms: u64,
    pub energy_interval_ms: u64,
    pub stream_interval_ms: u64,
    /// Consecutive transient failures after which a device is considered lost
    pub max_consecutive_failures: u32,
    /// Delay before reconnecting a configured device that was lost
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainsConfig {
    pub cpu: bool,
    pub memory: bool,
    pub network: bool,
    pub event: bool,
    pub energy: bool,
    pub event_stream: bool,
    /// Start domain pollers automatically for newly discovered processes
    pub auto_monitor: bool,
    /// Process names monitored even when no agent is attached
    pub monitor_processes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Concurrent payload fetches across all pollers
    pub workers: usize,
    /// Attempts while the remote reports a dump as not ready
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationTrackingMode {
    /// Live when the device API level and agent attach state allow it, legacy otherwise
    Auto,
    Live,
    Legacy,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub allocation_tracking: AllocationTrackingMode,
    /// Minimum device API level for live allocation tracking in `auto` mode
    pub live_min_api_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .map(|d| d.join("devmirror"))
                .unwrap_or_else(|| PathBuf::from(".devmirror")),
            devices: Vec::new(),
            transport: TransportConfig::default(),
            polling: PollingConfig::default(),
            domains: DomainsConfig::default(),
            payload: PayloadConfig::default(),
            memory: MemoryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            forward_program: "adb".to_string(),
            forward_args: ["-s", "{device}", "forward", "tcp:{port}", "localabstract:{socket}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            remove_args: ["-s", "{device}", "forward", "--remove", "tcp:{port}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            device_socket: "DevMirrorTransport".to_string(),
            request_timeout_ms: 15_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 1_000,
            cpu_interval_ms: 250,
            memory_interval_ms: 250,
            network_interval_ms: 250,
            event_interval_ms: 250,
            energy_interval_ms: 500,
            stream_interval_ms: 250,
            max_consecutive_failures: 3,
            reconnect_delay_ms: 2_000,
        }
    }
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            network: true,
            event: true,
            energy: true,
            event_stream: true,
            auto_monitor: true,
            monitor_processes: Vec::new(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry_attempts: 10,
            retry_delay_ms: 500,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            allocation_tracking: AllocationTrackingMode::Auto,
            live_min_api_level: 26,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl PollingConfig {
    pub fn discovery_period(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn stream_period(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl AgentConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                if let Ok(c) = serde_json::from_str::<AgentConfig>(&data) {
                    return c;
                }
            }
        }
        Self::default()
    }
}
