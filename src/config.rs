//! Configuration file handling

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timeouts and delays the engine works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound for ordinary device queries
    pub query_timeout: Duration,
    /// Upper bound for whole-device checksum commands
    pub checksum_timeout: Duration,
    /// Settle time after a failed restore write before reconnecting
    pub restore_cooldown: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            query_timeout: crate::channel::DEFAULT_TIMEOUT,
            checksum_timeout: crate::channel::CHECKSUM_TIMEOUT,
            restore_cooldown: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    /// Default timeouts without the restore cooldown
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            restore_cooldown: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub device: DeviceConfig,
    pub restore: RestoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backups live under `<share_dir>/backups/<id>/`
    pub share_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Program and arguments the remote command is appended to
    pub command: Vec<String>,
    pub query_timeout_secs: u64,
    pub checksum_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let share_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".tablet-backup"));
        Self { share_dir }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "ssh".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "root@10.11.99.1".to_string(),
            ],
            query_timeout_secs: 30,
            checksum_timeout_secs: 300,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { cooldown_secs: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "tablet-backup")
}

impl Config {
    /// Load from the default location, writing defaults if the file is missing
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content).map_err(|e| Error::Configuration {
                reason: format!("failed to parse {}: {}", path.display(), e),
            })?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Configuration {
            reason: format!("failed to serialize config: {}", e),
        })?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let dirs = project_dirs().ok_or_else(|| Error::Configuration {
            reason: "could not determine config directory".to_string(),
        })?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self
            .device
            .command
            .first()
            .map_or(true, |program| program.trim().is_empty())
        {
            return Err(Error::Configuration {
                reason: "device.command must name a program".to_string(),
            });
        }
        if self.device.query_timeout_secs == 0 || self.device.checksum_timeout_secs == 0 {
            return Err(Error::Configuration {
                reason: "device timeouts must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Directory holding one subdirectory per backup
    pub fn backup_dir(&self) -> PathBuf {
        self.storage.share_dir.join("backups")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            query_timeout: Duration::from_secs(self.device.query_timeout_secs),
            checksum_timeout: Duration::from_secs(self.device.checksum_timeout_secs),
            restore_cooldown: Duration::from_secs(self.restore.cooldown_secs),
        }
    }
}
