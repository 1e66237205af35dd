//! Configuration for the registry and messaging nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//! Command-line arguments given to the binaries override all of these.
//!
//! Config file location:
//!   1. $OVERLAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/overlay/config.toml
//!   3. ~/.config/overlay/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub registry: RegistryConfig,
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host messaging nodes dial. The registry itself binds 0.0.0.0.
    pub host: String,
    /// TCP port the registry listens on.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP port for inbound neighbor links. 0 = OS-assigned.
    pub listen_port: u16,
    /// IPv4 address advertised at registration. Empty = local address of the
    /// registry link.
    pub advertise_host: String,
    /// Base seed for packet generation. Each node mixes in its own id.
    pub seed: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            advertise_host: String::new(),
            seed: 0,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("overlay")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl OverlayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file, or return defaults if it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(OverlayConfig::default());
        }
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("OVERLAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write the given config to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply OVERLAY_* overrides. `lookup` is `std::env::var` in production;
    /// tests pass a map so they never touch process env.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OVERLAY_REGISTRY__HOST") {
            self.registry.host = v;
        }
        if let Some(p) = lookup("OVERLAY_REGISTRY__PORT").and_then(|v| v.parse().ok()) {
            self.registry.port = p;
        }
        if let Some(p) = lookup("OVERLAY_NODE__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.node.listen_port = p;
        }
        if let Some(v) = lookup("OVERLAY_NODE__ADVERTISE_HOST") {
            self.node.advertise_host = v;
        }
        if let Some(s) = lookup("OVERLAY_NODE__SEED").and_then(|v| v.parse().ok()) {
            self.node.seed = s;
        }
    }
}
