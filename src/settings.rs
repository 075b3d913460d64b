// src/settings.rs
//
// Transport tunables. Every field has a serde default so a partial (or
// empty) TOML document yields a complete configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::io::IoError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TransportSettings {
    /// Read buffer capacity (bytes); also the longest line that can be framed
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Serial write buffer capacity (bytes)
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    /// Delay before reconnecting after a TCP failure
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Delay before the first TCP connect attempt
    #[serde(default = "default_initial_connect_delay_ms")]
    pub initial_connect_delay_ms: u64,
    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,
    #[serde(default)]
    pub keepalive: KeepaliveSettings,
    /// Serial control flags, e.g. "CS8" or "CS7 CRTSCTS"
    #[serde(default = "default_line_flags")]
    pub line_flags: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KeepaliveSettings {
    #[serde(default = "default_keepalive_idle_secs")]
    pub idle_secs: u64,
    /// Linux/Android only
    #[serde(default = "default_keepalive_interval_secs")]
    pub interval_secs: u64,
    /// Linux/Android only
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
}

fn default_read_buffer_size() -> usize {
    4096
}
fn default_write_buffer_size() -> usize {
    4096
}
fn default_retry_interval_ms() -> u64 {
    10_000
}
fn default_initial_connect_delay_ms() -> u64 {
    1
}
fn default_tcp_nodelay() -> bool {
    true
}
fn default_line_flags() -> String {
    "CS8".to_string()
}
fn default_keepalive_idle_secs() -> u64 {
    5
}
fn default_keepalive_interval_secs() -> u64 {
    5
}
fn default_keepalive_count() -> u32 {
    6
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            idle_secs: default_keepalive_idle_secs(),
            interval_secs: default_keepalive_interval_secs(),
            count: default_keepalive_count(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            retry_interval_ms: default_retry_interval_ms(),
            initial_connect_delay_ms: default_initial_connect_delay_ms(),
            tcp_nodelay: default_tcp_nodelay(),
            keepalive: KeepaliveSettings::default(),
            line_flags: default_line_flags(),
        }
    }
}

impl TransportSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn initial_connect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_connect_delay_ms)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, IoError> {
        let settings: TransportSettings = toml::from_str(content)
            .map_err(|e| IoError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, IoError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IoError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), IoError> {
        if self.read_buffer_size == 0 {
            return Err(IoError::Config("read_buffer_size must be > 0".to_string()));
        }
        if self.write_buffer_size == 0 {
            return Err(IoError::Config("write_buffer_size must be > 0".to_string()));
        }
        Ok(())
    }
}
