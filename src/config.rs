// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const REAL_DEBRID_API: &str = "https://api.real-debrid.com/rest/1.0";
pub const TORBOX_API: &str = "https://api.torbox.app/v1/api";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine settings. Every field has a default, so an empty or missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Where new jobs are saved unless the caller chooses otherwise.
    pub downloads_path: PathBuf,
    pub database_path: PathBuf,
    /// Keep finished torrents seeding.
    pub seed_after_download: bool,
    /// Upper bound on waiting for an adapter to acknowledge pause/cancel.
    pub cancel_timeout_ms: u64,
    pub broadcast_capacity: usize,
    pub agent: AgentConfig,
    pub http: HttpConfig,
    pub cloud: CloudConfig,
    pub extraction: ExtractionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            downloads_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from("downloads")),
            database_path: PathBuf::from("gamedl.db"),
            seed_after_download: false,
            cancel_timeout_ms: 5_000,
            broadcast_capacity: 256,
            agent: AgentConfig::default(),
            http: HttpConfig::default(),
            cloud: CloudConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub binary_path: PathBuf,
    /// Port the agent listens on for its own peer protocol.
    pub listen_port: u16,
    pub connect_timeout_ms: u64,
    /// Directory holding the request/response sockets (ignored for named pipes).
    pub pipe_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let name = if cfg!(windows) { "transfer-agent.exe" } else { "transfer-agent" };
        let binary_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .unwrap_or_else(|| PathBuf::from(name));
        Self {
            binary_path,
            listen_port: 5881,
            connect_timeout_ms: 10_000,
            pipe_dir: std::env::temp_dir(),
        }
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub retries: usize,
    /// Connect timeout and maximum silence between body chunks.
    pub timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { retries: 3, timeout_secs: 30, progress_interval_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    pub real_debrid_token: Option<String>,
    pub torbox_token: Option<String>,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub real_debrid_base_url: String,
    pub torbox_base_url: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            real_debrid_token: None,
            torbox_token: None,
            poll_interval_ms: 5_000,
            poll_attempts: 12,
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            real_debrid_base_url: REAL_DEBRID_API.to_string(),
            torbox_base_url: TORBOX_API.to_string(),
        }
    }
}

impl CloudConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    pub enabled: bool,
    pub seven_zip_path: PathBuf,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self { enabled: true, seven_zip_path: PathBuf::from("7z") }
    }
}
