//! Service configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen address of the development transport.
    pub listen_addr: String,

    /// Server-side flow-control parameters.
    pub channel: ChannelConfig,

    /// Demonstration shell.
    pub shell: ShellConfig,

    /// Direct-TCP forwarding policy.
    pub forwarding: ForwardingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2223".to_string(),
            channel: ChannelConfig::default(),
            shell: ShellConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

/// Window and packet size the server advertises for every channel it confirms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    pub initial_window_size: u32,
    pub max_packet_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_window_size: 2 * 1024 * 1024,
            max_packet_size: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    /// First line sent when a shell starts.
    pub banner: String,

    pub prompt: String,

    /// Echo typed bytes back to the client.
    pub echo: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            banner: "VC-4 Control Console".to_string(),
            prompt: "VC-4>".to_string(),
            echo: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Allow direct-tcpip channels (ssh -L).
    pub allow_direct_tcpip: bool,

    /// Allow forwarding to destinations other than loopback.
    pub allow_nonlocal_destinations: bool,

    /// Timeout for the outbound connect of a forward.
    pub connect_timeout_secs: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            allow_direct_tcpip: true,
            allow_nonlocal_destinations: false,
            connect_timeout_secs: 10,
        }
    }
}

impl ForwardingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
