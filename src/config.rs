//! Application configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) is valid. Durations are in milliseconds.
//!
//! ```toml
//! [stream]
//! server_ip = "192.168.1.100"
//! server_port = 8888
//!
//! [transport]
//! retry_delay_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub transport: TransportConfig,
    pub generator: GeneratorConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Where to stream and what the stream looks like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub server_ip: String,
    pub server_port: u16,
    /// Advertised when the link has not reported a codec yet
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub queue_capacity: usize,
    pub evict_batch: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            sample_rate: 8_000,
            channels: 1,
            bits_per_sample: 16,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            evict_batch: DEFAULT_EVICT_BATCH,
        }
    }
}

impl StreamConfig {
    pub fn new(server_ip: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_ip: server_ip.into(),
            server_port,
            ..Default::default()
        }
    }

    /// Check the configuration and resolve the server address
    pub fn validate(&self) -> Result<SocketAddrV4, ConfigError> {
        let ip: Ipv4Addr = self
            .server_ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.server_ip.clone()))?;
        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort(self.server_port));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.queue_capacity));
        }
        if self.channels == 0 {
            return Err(ConfigError::InvalidValue {
                field: "channels",
                reason: "must be at least 1".to_string(),
            });
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(ConfigError::InvalidValue {
                field: "bits_per_sample",
                reason: format!("unsupported width {}", self.bits_per_sample),
            });
        }
        Ok(SocketAddrV4::new(ip, self.server_port))
    }
}

/// Reconnect loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Fixed wait after a failed connect or a dropped connection
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Write timeout on the connected socket
    pub send_timeout_ms: u64,
    /// How long the transport waits on an empty queue before re-checking the link
    pub idle_poll_ms: u64,
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            send_timeout_ms: 2_000,
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// Outbound silence generator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub tick_us: u64,
    /// Audio time covered by one generated frame
    pub frame_period_us: u64,
    pub ring_capacity: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            tick_us: DEFAULT_GENERATOR_TICK_US,
            frame_period_us: crate::protocol::PCM_BLOCK_DURATION_US,
            ring_capacity: DEFAULT_OUTBOUND_RING_BYTES,
        }
    }
}

impl GeneratorConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_us.max(1))
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(self.frame_period_us.max(1))
    }
}

/// Signal level reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub report_period_ms: u64,
    /// Minimum spacing of repeated warnings on the capture path
    pub log_interval_ms: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_period_ms: DEFAULT_REPORT_PERIOD_MS,
            log_interval_ms: DEFAULT_LOG_INTERVAL_MS,
        }
    }
}

impl DiagnosticsConfig {
    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.report_period_ms.max(1))
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }
}

impl AppConfig {
    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Per-user config location, e.g. `~/.config/sco-stream-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "sco-stream-bridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the per-user config if present, otherwise defaults
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "loading configuration");
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }
}
