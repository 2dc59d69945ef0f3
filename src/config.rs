//! # Configuration Management
//!
//! treesync reads a single TOML file with a `[server]` and a `[client]`
//! table. Every field has a default, so a partial file (or none at all) is
//! valid.
//!
//! The file lives in a platform-appropriate directory (e.g.
//! `~/.config/treesync/config.toml` on Linux). Set `TREESYNC_CONFIG_DIR` to
//! point somewhere else, or pass `--config` on the command line.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:5000"
//! root = "server_sync_folder"
//!
//! [client]
//! server_addr = "127.0.0.1:5000"
//! root = "client_sync_folder"
//! sync_interval_secs = 10
//! conflict_policy = "remote-wins"
//!
//! [client.retry]
//! initial_delay_ms = 500
//! max_delay_ms = 30000
//! multiplier = 2.0
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bandwidth::BandwidthManager;
use crate::diff::ConflictPolicy;
use crate::manifest::{ScanOptions, SymlinkPolicy};
use crate::sync::SyncOptions;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "TREESYNC_CONFIG_DIR";

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub root: PathBuf,
    pub symlinks: SymlinkPolicy,
    /// Bytes per second sent to clients. Unlimited when absent.
    pub bandwidth_limit_up: Option<u64>,
    /// Bytes per second received from clients. Unlimited when absent.
    pub bandwidth_limit_down: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            root: PathBuf::from("server_sync_folder"),
            symlinks: SymlinkPolicy::default(),
            bandwidth_limit_up: None,
            bandwidth_limit_down: None,
        }
    }
}

impl ServerConfig {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            symlinks: self.symlinks,
        }
    }

    pub fn bandwidth(&self) -> BandwidthManager {
        BandwidthManager::new(self.bandwidth_limit_up, self.bandwidth_limit_down)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub root: PathBuf,
    /// Seconds between full sync passes. `0` disables periodic passes.
    pub sync_interval_secs: u64,
    pub conflict_policy: ConflictPolicy,
    pub symlinks: SymlinkPolicy,
    /// Watch the root for changes and push them between full passes.
    pub watch: bool,
    pub bandwidth_limit_up: Option<u64>,
    pub bandwidth_limit_down: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5000".to_string(),
            root: PathBuf::from("client_sync_folder"),
            sync_interval_secs: 10,
            conflict_policy: ConflictPolicy::default(),
            symlinks: SymlinkPolicy::default(),
            watch: true,
            bandwidth_limit_up: None,
            bandwidth_limit_down: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            symlinks: self.symlinks,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            scan: self.scan_options(),
            conflict_policy: self.conflict_policy,
            bandwidth: Arc::new(BandwidthManager::new(
                self.bandwidth_limit_up,
                self.bandwidth_limit_down,
            )),
        }
    }
}

/// Reconnect backoff. A multiplier of `1.0` gives a fixed delay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Give up after this many failed attempts. Retries forever when absent.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Config {
    /// Write a default configuration to the default location.
    pub async fn init() -> Result<Self> {
        let config_file = Self::config_dir()?.join(CONFIG_FILE_NAME);
        Self::init_at(&config_file).await
    }

    /// Write a default configuration to `path`. Refuses to overwrite.
    pub async fn init_at(path: &Path) -> Result<Self> {
        if path.exists() {
            anyhow::bail!("Configuration already exists at {}", path.display());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let config = Self {
            config_file_path: path.to_path_buf(),
            ..Self::default()
        };
        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join(CONFIG_FILE_NAME);
        if !config_file.exists() {
            anyhow::bail!("treesync not initialized. Run 'treesync init' first.");
        }
        Self::load_from(&config_file).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.config_file_path = path.to_path_buf();
        Ok(config)
    }

    /// Load `explicit` if given, else the default file if it exists, else defaults.
    pub async fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path).await;
        }
        let config_file = Self::config_dir()?.join(CONFIG_FILE_NAME);
        if config_file.exists() {
            Self::load_from(&config_file).await
        } else {
            Ok(Self {
                config_file_path: config_file,
                ..Self::default()
            })
        }
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.config_file_path.display()))?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("treesync");
        Ok(config_dir)
    }
}
