// SPDX-License-Identifier: GPL-3.0-only

//! Partition handles
//!
//! - [`RawPartition`]: kernel partition of an nbd export, mounted on the host
//! - [`LvmPartition`]: logical volume activated on the host from such a partition
//! - [`GuestfsPartition`]: filesystem inside a guestfish worker, surfaced via FUSE

mod guestfs;
mod lvm;
mod raw;

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use hostdisk_contracts::CommandRunner;
use hostdisk_sys::{Blkid, KeyedLocks, MountTools};
use hostdisk_types::MountConfig;

pub use guestfs::GuestfsPartition;
pub use lvm::LvmPartition;
pub use raw::RawPartition;

/// Tells when a FUSE view has appeared on a host directory
#[async_trait]
pub trait MountProbe: Send + Sync {
    async fn is_mounted(&self, dir: &Path) -> bool;
}

/// A view is up once the directory sits on another device than its parent
/// and can be listed
pub struct DeviceChangeProbe;

#[async_trait]
impl MountProbe for DeviceChangeProbe {
    async fn is_mounted(&self, dir: &Path) -> bool {
        let Some(parent) = dir.parent() else {
            return false;
        };
        let (Ok(own), Ok(parent)) =
            (tokio::fs::metadata(dir).await, tokio::fs::metadata(parent).await)
        else {
            return false;
        };
        own.dev() != parent.dev() && tokio::fs::read_dir(dir).await.is_ok()
    }
}

/// Host tools and locks shared by every partition handle
pub struct PartitionEnv {
    tools: MountTools,
    blkid: Blkid,
    uuid_locks: KeyedLocks,
    probe: Arc<dyn MountProbe>,
    config: MountConfig,
}

impl PartitionEnv {
    pub fn new(runner: Arc<dyn CommandRunner>, config: MountConfig) -> Self {
        Self {
            tools: MountTools::new(runner.clone()),
            blkid: Blkid::new(runner),
            uuid_locks: KeyedLocks::new(),
            probe: Arc::new(DeviceChangeProbe),
            config,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MountProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn mount_probe(&self) -> &dyn MountProbe {
        self.probe.as_ref()
    }

    pub fn tools(&self) -> &MountTools {
        &self.tools
    }

    pub fn blkid(&self) -> &Blkid {
        &self.blkid
    }

    /// Filesystems that refuse duplicate UUIDs are serialized on these
    pub fn uuid_locks(&self) -> &KeyedLocks {
        &self.uuid_locks
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Mount point for a device; unique as long as the device node is
    pub fn mount_dir_for(&self, part_dev: &str) -> PathBuf {
        self.config.root.join(mount_dir_name(part_dev))
    }

    /// Pause before mount attempt `attempt + 1`
    pub(crate) fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.config.retry_jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=self.config.retry_jitter_ms)
        };
        self.config.retry_base() * attempt + Duration::from_millis(jitter)
    }
}

/// `/dev/nbd0p1` -> `nbd0p1`, `/dev/hdvg/root` -> `hdvg-root`
pub fn mount_dir_name(part_dev: &str) -> String {
    let trimmed = part_dev
        .strip_prefix("/dev/")
        .unwrap_or(part_dev)
        .trim_matches('/');
    trimmed.replace('/', "-")
}

/// Lock-free view of a handle's mount state for the sync accessors
#[derive(Debug, Default)]
struct MountFlags {
    mounted: AtomicBool,
    readonly: AtomicBool,
}

impl MountFlags {
    fn set_mounted(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
        self.mounted.store(true, Ordering::SeqCst);
    }

    fn set_unmounted(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        self.readonly.store(false, Ordering::SeqCst);
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }
}

async fn remove_mount_dir(dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir(dir).await {
        tracing::debug!(dir = %dir.display(), "mount point left behind: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_dirs_follow_device_names() {
        assert_eq!(mount_dir_name("/dev/nbd0p1"), "nbd0p1");
        assert_eq!(mount_dir_name("/dev/hd1f2e/root"), "hd1f2e-root");
        assert_eq!(mount_dir_name("/dev/mapper/vg-lv"), "mapper-vg-lv");
    }

    #[tokio::test]
    async fn plain_directory_is_not_a_mounted_view() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("view");
        assert!(!DeviceChangeProbe.is_mounted(&dir).await);

        std::fs::create_dir(&dir).unwrap();
        assert!(!DeviceChangeProbe.is_mounted(&dir).await);
    }

    #[test]
    fn retry_delay_grows_with_attempts() {
        let env = PartitionEnv::new(
            Arc::new(hostdisk_contracts::testing::ScriptedRunner::succeeding()),
            MountConfig {
                retry_base_ms: 100,
                retry_jitter_ms: 0,
                ..MountConfig::default()
            },
        );
        assert_eq!(env.retry_delay(1), Duration::from_millis(100));
        assert_eq!(env.retry_delay(3), Duration::from_millis(300));
    }
}
