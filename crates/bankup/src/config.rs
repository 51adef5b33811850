//! Device-side configuration.
//!
//! Loaded from a TOML file; every field that has a sensible default can be
//! omitted. The device needs at least two flash banks unless running in
//! dry-run mode.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::OtaError;

fn default_host() -> String {
    "http://thingy.jp".to_string()
}

fn default_path() -> String {
    "/ota/spibeagle".to_string()
}

fn default_poll_interval() -> u64 {
    60 * 10
}

fn default_stamp_path() -> PathBuf {
    PathBuf::from("/etc/bankup/stamp.json")
}

/// Device update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Repository host base URL.
    #[serde(default = "default_host")]
    pub host: String,

    /// Repository path prefix on the host.
    #[serde(default = "default_path")]
    pub path: String,

    /// Directory holding the pinned device public key (`rsa.pub`).
    pub keys_dir: PathBuf,

    /// Flash bank device paths; at least two unless `dry_run`.
    #[serde(default)]
    pub banks: Vec<PathBuf>,

    /// File holding the boot-source byte offset of the running partition.
    #[serde(default)]
    pub boot_source: Option<PathBuf>,

    /// Polling period in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Perform every step except erase, flash, and reboot.
    #[serde(default)]
    pub dry_run: bool,

    /// Consider any enabled image a candidate regardless of version.
    #[serde(default)]
    pub force: bool,

    /// Persisted current-version marker (a build stamp).
    #[serde(default = "default_stamp_path")]
    pub stamp_path: PathBuf,
}

impl DeviceConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, OtaError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| OtaError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), OtaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| OtaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
