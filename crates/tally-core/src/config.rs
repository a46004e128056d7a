//! Configuration system for Tally.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TALLY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tally/config.toml
//!   3. ~/.config/tally/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{CONTENT_HEADER_LEN, DEFAULT_MTU};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the UDP socket binds to.
    pub bind_addr: IpAddr,
    /// UDP port. 0 = OS-assigned.
    pub port: u16,
    /// Largest datagram sent, header included.
    pub mtu: usize,
}

/// Timer-driven reliability settings. Counts are in reaper ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Reaper period.
    pub tick_interval_ms: u64,
    /// A session with no inbound datagram for more ticks than this is evicted.
    pub idle_timeout_ticks: u32,
    /// Ticks without ack progress before unacknowledged chunks are resent.
    pub retransmit_after_ticks: u32,
    /// Retransmissions without progress before the peer is declared unreachable.
    pub retry_budget: u32,
    /// Upper bound on one socket wait, so the loop can observe shutdown.
    pub recv_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker tasks running message handlers.
    pub workers: usize,
    /// Reassembled messages waiting for a worker. Beyond this the server answers busy.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file. Ignored by the memory backend.
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 7777;

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            mtu: DEFAULT_MTU,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            idle_timeout_ticks: 300, // 30 s
            retransmit_after_ticks: 3,
            retry_budget: 10,
            recv_timeout_ms: 500,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 256,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: data_dir().join("finance.db"),
        }
    }
}

impl NetworkConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

impl ProtocolConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tally")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tally")
}

fn dirs_or_home() -> PathBuf {
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TallyConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TallyConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TALLY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TallyConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.mtu <= CONTENT_HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "mtu {} leaves no room for payload after the {}-byte header",
                self.network.mtu, CONTENT_HEADER_LEN
            )));
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Invalid("dispatch.workers must be at least 1".into()));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.queue_depth must be at least 1".into(),
            ));
        }
        if self.protocol.tick_interval_ms == 0 || self.protocol.recv_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "protocol intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply TALLY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TALLY_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("TALLY_NETWORK__MTU") {
            if let Ok(m) = v.parse() {
                self.network.mtu = m;
            }
        }
        if let Ok(v) = std::env::var("TALLY_DISPATCH__WORKERS") {
            if let Ok(n) = v.parse() {
                self.dispatch.workers = n;
            }
        }
        if let Ok(v) = std::env::var("TALLY_STORAGE__BACKEND") {
            match v.as_str() {
                "sqlite" => self.storage.backend = StorageBackend::Sqlite,
                "memory" => self.storage.backend = StorageBackend::Memory,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("TALLY_STORAGE__PATH") {
            self.storage.path = PathBuf::from(v);
        }
    }
}
