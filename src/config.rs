//! Configuration loading and persistence.
//!
//! Endpoints, timeouts and the reconnect policy live in
//! `<config dir>/neolink/config.json`. Environment variables override the
//! file; the session token is only ever taken from the environment or the
//! command line and is never written to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::channel::ReconnectPolicy;

const CONFIG_FILE: &str = "config.json";

/// Configuration for the session manager.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the one-on-one chat endpoint.
    pub primary_ws_url: String,
    /// WebSocket URL of the group/room endpoint.
    pub group_ws_url: String,
    /// Base URL of the account API.
    pub api_base_url: String,
    /// Base URL of the chat history API.
    pub neo_base_url: String,
    /// Edge rollout tag sent in the session cookie.
    pub edge_rollout: String,
    /// Default deadline for correlated requests, in milliseconds.
    pub request_timeout_ms: u64,
    /// Consecutive reconnect attempts before a channel gives up.
    pub reconnect_max_attempts: u32,
    /// Fixed delay between reconnect attempts, in seconds.
    pub reconnect_delay_secs: u64,
    /// Bound on one dial plus handshake, in seconds.
    pub connect_timeout_secs: u64,
    /// Session token - NOT serialized to disk.
    #[serde(skip)]
    pub token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_ws_url: "wss://neo.character.ai/ws/".to_string(),
            group_ws_url: "wss://neo.character.ai/connection/websocket".to_string(),
            api_base_url: "https://plus.character.ai".to_string(),
            neo_base_url: "https://neo.character.ai".to_string(),
            edge_rollout: "60".to_string(),
            request_timeout_ms: 30_000,
            reconnect_max_attempts: 5,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            token: String::new(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `NEOLINK_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("NEOLINK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("neolink")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides. A missing or unreadable file means defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        let mut config = Self::load_from(&path).unwrap_or_else(|e| {
            log::debug!("[Config] Using defaults: {:#}", e);
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads one config file. Fields it omits keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Apply `NEOLINK_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("NEOLINK_TOKEN") {
            self.token = token;
        }
        if let Some(url) = lookup("NEOLINK_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("NEOLINK_NEO_URL") {
            self.neo_base_url = url;
        }
        if let Some(url) = lookup("NEOLINK_PRIMARY_WS_URL") {
            self.primary_ws_url = url;
        }
        if let Some(url) = lookup("NEOLINK_GROUP_WS_URL") {
            self.group_ws_url = url;
        }
        if let Some(tag) = lookup("NEOLINK_EDGE_ROLLOUT") {
            self.edge_rollout = tag;
        }
        if let Some(timeout) = lookup("NEOLINK_REQUEST_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.request_timeout_ms = ms,
                Err(_) => log::warn!("[Config] Ignoring invalid NEOLINK_REQUEST_TIMEOUT_MS={}", timeout),
            }
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Persists the configuration to `path`, owner read/write only.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Reconnect policy for every transport channel.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_max_attempts,
            Duration::from_secs(self.reconnect_delay_secs),
        )
        .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    /// Default deadline for correlated requests.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
