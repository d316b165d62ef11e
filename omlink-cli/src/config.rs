//! Configuration file support for omlink.
//!
//! Sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (OMLINK_*)
//! 3. Local config file (./omlink.toml)
//! 4. Global config file (~/.config/omlink/config.toml)
//!
//! `--config PATH` replaces both files.

use directories::ProjectDirs;
use log::{debug, info, warn};
use omlink::UploadConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "omlink.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Modbus address of the module.
    pub target: Option<u8>,
}

/// Upload tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSection {
    /// Control block reads per block.
    pub verify_attempts: Option<u32>,
    /// Pause between control block reads, in milliseconds.
    pub retry_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadSection,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global);
            }
        }

        if let Some(local) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "omlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.target.is_some() {
            self.connection.target = other.connection.target;
        }
        if other.upload.verify_attempts.is_some() {
            self.upload.verify_attempts = other.upload.verify_attempts;
        }
        if other.upload.retry_delay_ms.is_some() {
            self.upload.retry_delay_ms = other.upload.retry_delay_ms;
        }
    }

    /// Upload settings with the configured overrides applied.
    pub fn upload_config(&self) -> UploadConfig {
        let mut upload = UploadConfig::default();
        if let Some(attempts) = self.upload.verify_attempts {
            upload = upload.with_verify_attempts(attempts);
        }
        if let Some(ms) = self.upload.retry_delay_ms {
            upload = upload.with_retry_delay(Duration::from_millis(ms));
        }
        upload
    }

    /// Remember `port` in the local config file.
    pub fn save_port(&mut self, port: &str) -> anyhow::Result<()> {
        let path = Path::new(LOCAL_CONFIG_FILE);
        let mut local = Self::load_from_file(path).unwrap_or_default();
        local.connection.port = Some(port.to_string());

        fs::write(path, toml::to_string_pretty(&local)?)?;
        self.connection.port = Some(port.to_string());
        info!("Saved port {port} to {}", path.display());
        Ok(())
    }
}
