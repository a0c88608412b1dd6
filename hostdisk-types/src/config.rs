// SPDX-License-Identifier: GPL-3.0-only

//! Process-wide configuration
//!
//! Every key has a default so an empty (or missing) file yields a usable
//! configuration. The file format is TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "HOSTDISK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("invalid config {path:?}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDiskConfig {
    pub nbd: NbdConfig,
    pub guestfs: GuestfsConfig,
    pub mount: MountConfig,
    pub lvm: LvmConfig,
    pub log: LogConfig,
}

/// Block-device exposure settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// Directory holding the `nbdN` device nodes
    pub dev_dir: PathBuf,
    /// sysfs block directory used to detect devices claimed outside this process
    pub sys_block_dir: PathBuf,
    pub qemu_nbd: String,
    pub qemu_img: String,
    /// Minimum `qemu-nbd` version that understands `--fork`
    pub fork_min_version: String,
    pub partition_probe_tries: u32,
    pub partition_probe_base_ms: u64,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sys_block_dir: PathBuf::from("/sys/block"),
            qemu_nbd: "qemu-nbd".to_string(),
            qemu_img: "qemu-img".to_string(),
            fork_min_version: "4.0.0".to_string(),
            partition_probe_tries: 3,
            partition_probe_base_ms: 1000,
        }
    }
}

impl NbdConfig {
    pub fn partition_probe_base(&self) -> Duration {
        Duration::from_millis(self.partition_probe_base_ms)
    }
}

/// Interactive worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestfsConfig {
    pub enabled: bool,
    pub binary: String,
    pub args: Vec<String>,
    /// Prompt printed by the worker; used as the response sentinel
    pub prompt: String,
    /// Upper bound on simultaneously existing workers
    pub maximum: usize,
    pub acquire_attempts: usize,
    pub stderr_drain_ms: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for GuestfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "guestfish".to_string(),
            args: Vec::new(),
            prompt: "><fs>".to_string(),
            maximum: 3,
            acquire_attempts: 3,
            stderr_drain_ms: 1000,
            idle_timeout_secs: 600,
            sweep_interval_secs: 600,
        }
    }
}

impl GuestfsConfig {
    pub fn stderr_drain(&self) -> Duration {
        Duration::from_millis(self.stderr_drain_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Parent directory for per-partition mount points
    pub root: PathBuf,
    pub retries: u32,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    /// How long a worker-backed mount may take to become visible
    pub probe_timeout_ms: u64,
    pub fsck_attempts: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/run/hostdisk"),
            retries: 3,
            retry_base_ms: 1000,
            retry_jitter_ms: 500,
            probe_timeout_ms: 3000,
            fsck_attempts: 3,
        }
    }
}

impl MountConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvmConfig {
    /// Delay before listing logical volumes a second time
    pub lv_retry_delay_ms: u64,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            lv_retry_delay_ms: 1000,
        }
    }
}

impl LvmConfig {
    pub fn lv_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lv_retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub keep_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            keep_days: 7,
        }
    }
}

impl HostDiskConfig {
    /// Load from an explicit path, the `HOSTDISK_CONFIG` file, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        match std::env::var_os(CONFIG_ENV) {
            Some(value) => Self::load_from_path(Path::new(&value)),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;

        Self::parse(&raw).map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(raw).map_err(|error| error.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.guestfs.maximum == 0 {
            return Err("guestfs.maximum must be at least 1".to_string());
        }
        if self.guestfs.acquire_attempts == 0 {
            return Err("guestfs.acquire_attempts must be at least 1".to_string());
        }
        if self.nbd.partition_probe_tries == 0 {
            return Err("nbd.partition_probe_tries must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = HostDiskConfig::parse("").expect("empty config parses");
        assert_eq!(config, HostDiskConfig::default());
        assert_eq!(config.guestfs.maximum, 3);
        assert_eq!(config.guestfs.prompt, "><fs>");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = HostDiskConfig::parse(
            "[guestfs]\nmaximum = 8\n\n[nbd]\ndev_dir = \"/tmp/devs\"\n",
        )
        .expect("partial config parses");

        assert_eq!(config.guestfs.maximum, 8);
        assert_eq!(config.guestfs.binary, "guestfish");
        assert_eq!(config.nbd.dev_dir, PathBuf::from("/tmp/devs"));
        assert_eq!(config.nbd.qemu_nbd, "qemu-nbd");
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let error = HostDiskConfig::parse("[guestfs]\nmaximum = 0\n").unwrap_err();
        assert!(error.contains("guestfs.maximum"));
    }
}
