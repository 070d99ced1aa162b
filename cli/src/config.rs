//! Agent configuration
//!
//! Persisted at `~/.mobilecli/agent.json`. The agent id is generated on first
//! run and never changes afterwards; the bridge uses it to recognise this host
//! across reconnects and restarts.
//!
//! Precedence: config file, then environment, then command-line flags.

use crate::platform;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default local listener port
pub const DEFAULT_PORT: u16 = 9847;

/// Default coding-assistant binary spawned for bridge-started sessions
pub const DEFAULT_ASSISTANT_COMMAND: &str = "claude";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Configuration stored for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: String,
    /// Bridge WebSocket URL; local-only when unset
    #[serde(default)]
    pub bridge_url: Option<String>,
    #[serde(default = "platform::host_name")]
    pub host_name: String,
    #[serde(default = "default_port")]
    pub local_port: u16,
    #[serde(default = "default_assistant_command")]
    pub assistant_command: String,
    /// Extra arguments placed before the session arguments
    #[serde(default)]
    pub assistant_args: Vec<String>,
    /// Forward terminal output from local owners to the bridge
    #[serde(default = "default_true")]
    pub forward_terminal_output: bool,
    /// Pre-shared E2E key (base64, 32 bytes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e_key: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_assistant_command() -> String {
    DEFAULT_ASSISTANT_COMMAND.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            bridge_url: None,
            host_name: platform::host_name(),
            local_port: DEFAULT_PORT,
            assistant_command: default_assistant_command(),
            assistant_args: Vec::new(),
            forward_terminal_output: true,
            e2e_key: None,
        }
    }
}

/// Get the config file path (cross-platform)
pub fn config_file() -> PathBuf {
    platform::config_dir().join("agent.json")
}

impl AgentConfig {
    /// Load the config, creating it (and the agent id) on first run.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                tracing::info!("Created agent config with id {}", config.agent_id);
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        platform::write_private(path, data.as_bytes())?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MOBILECLI_BRIDGE_URL").filter(|s| !s.is_empty()) {
            self.bridge_url = Some(url);
        }
        if let Some(port) = lookup("MOBILECLI_AGENT_PORT") {
            match port.trim().parse() {
                Ok(port) => self.local_port = port,
                Err(_) => tracing::warn!("Ignoring invalid MOBILECLI_AGENT_PORT: {}", port),
            }
        }
        if let Some(host) = lookup("MOBILECLI_HOST_NAME").filter(|s| !s.is_empty()) {
            self.host_name = host;
        }
    }
}
