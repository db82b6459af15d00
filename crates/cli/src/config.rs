//! System-wide configuration
//!
//! Lives at `~/.config/pgbranch/config.toml`, next to the state file, the
//! WAL archive root and the per-project cert directories. Everything has a
//! default so a missing file just means stock settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub docker: DockerConfig,
    pub zfs: ZfsConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            docker: DockerConfig::default(),
            zfs: ZfsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image used when neither --image nor --pg-version is given.
    pub default_image: String,

    /// Grace period for `docker stop` in seconds.
    pub stop_timeout_secs: u32,

    /// Budget for a container to accept connections. PITR replay must fit
    /// inside this window too.
    pub ready_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            default_image: "postgres:17-alpine".to_string(),
            stop_timeout_secs: 10,
            ready_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZfsConfig {
    /// Dataset created under the pool to hold every branch dataset.
    pub dataset_base: String,

    pub compression: String,

    /// Matches PostgreSQL's 8 KiB page size.
    pub recordsize: String,

    pub atime_off: bool,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            dataset_base: "pgbranch".to_string(),
            compression: "lz4".to_string(),
            recordsize: "8K".to_string(),
            atime_off: true,
        }
    }
}

/// Directory holding config, state, WAL archives and certs.
pub fn config_root() -> Result<PathBuf> {
    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir().map(|h| h.join(".config/pgbranch"));

    #[cfg(not(target_os = "macos"))]
    let dir = dirs::config_dir().map(|c| c.join("pgbranch"));

    dir.context("could not determine config directory")
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_root()?.join("config.toml"))
}

/// Load system configuration, falling back to defaults when missing.
pub fn load() -> Result<SystemConfig> {
    let path = config_file_path()?;
    if !path.exists() {
        tracing::debug!("no config at {}, using defaults", path.display());
        return Ok(SystemConfig::default());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: SystemConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

pub fn save(config: &SystemConfig) -> Result<()> {
    let root = config_root()?;
    fs::create_dir_all(&root)
        .with_context(|| format!("failed to create {}", root.display()))?;

    let path = root.join("config.toml");
    let content = toml::to_string_pretty(config).context("failed to serialize config")?;
    fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("saved config to {}", path.display());
    Ok(())
}

/// Write the default config file if none exists yet.
pub fn init_if_missing() -> Result<()> {
    if config_file_path()?.exists() {
        return Ok(());
    }
    save(&SystemConfig::default())
}
