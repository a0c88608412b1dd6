// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use hostdisk_types::{FilesystemType, PartitionKind, PartitionTableType};

use crate::{DiskError, DiskErrorKind};

/// One filesystem-bearing region exposed by a connected disk
#[async_trait]
pub trait DiskPartition: Send + Sync {
    /// Device path as seen by whoever backs the partition
    fn part_dev(&self) -> &str;

    fn fs_type(&self) -> &FilesystemType;

    fn kind(&self) -> PartitionKind;

    /// Host directory the partition is mounted on
    fn mount_path(&self) -> &Path;

    /// Host path of `sub` inside the mounted filesystem
    fn local_path(&self, sub: &str) -> PathBuf {
        self.mount_path().join(sub.trim_start_matches('/'))
    }

    fn is_mounted(&self) -> bool;

    fn is_readonly(&self) -> bool;

    async fn mount_with(&self, readonly: bool) -> Result<(), DiskError>;

    async fn umount(&self) -> Result<(), DiskError>;

    /// Best-effort repair
    async fn fsck(&self) -> Result<(), DiskError>;

    async fn zerofree(&self) -> Result<(), DiskError>;

    /// Partition table type of the disk holding this partition
    async fn physical_partition_type(&self) -> Result<PartitionTableType, DiskError>;

    /// Mount read-write, falling back to read-only once
    ///
    /// Only a refused or stalled mount is retried; a partition that is already
    /// mounted or holds no mountable filesystem fails right away.
    async fn mount(&self) -> Result<(), DiskError> {
        match self.mount_with(false).await {
            Ok(()) => Ok(()),
            Err(error)
                if matches!(
                    error.kind,
                    DiskErrorKind::CommandFailed | DiskErrorKind::Timeout
                ) =>
            {
                warn!(
                    device = %self.part_dev(),
                    "read-write mount failed, retrying read-only: {error}"
                );
                self.mount_with(true).await
            }
            Err(error) => Err(error),
        }
    }

    async fn mount_read_only(&self) -> Result<(), DiskError> {
        self.mount_with(true).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct FakePartition {
        refuse_rw: bool,
        refuse_ro: bool,
        refusal: DiskErrorKind,
        mounted: AtomicBool,
        readonly: AtomicBool,
        attempts: Mutex<Vec<bool>>,
        fs_type: FilesystemType,
        dir: PathBuf,
    }

    impl FakePartition {
        fn new(refuse_rw: bool, refuse_ro: bool) -> Self {
            Self {
                refuse_rw,
                refuse_ro,
                refusal: DiskErrorKind::CommandFailed,
                mounted: AtomicBool::new(false),
                readonly: AtomicBool::new(false),
                attempts: Mutex::new(Vec::new()),
                fs_type: FilesystemType::Ext4,
                dir: PathBuf::from("/run/hostdisk/part"),
            }
        }
    }

    #[async_trait]
    impl DiskPartition for FakePartition {
        fn part_dev(&self) -> &str {
            "/dev/nbd0p1"
        }

        fn fs_type(&self) -> &FilesystemType {
            &self.fs_type
        }

        fn kind(&self) -> PartitionKind {
            PartitionKind::Nbd
        }

        fn mount_path(&self) -> &Path {
            &self.dir
        }

        fn is_mounted(&self) -> bool {
            self.mounted.load(Ordering::SeqCst)
        }

        fn is_readonly(&self) -> bool {
            self.readonly.load(Ordering::SeqCst)
        }

        async fn mount_with(&self, readonly: bool) -> Result<(), DiskError> {
            self.attempts.lock().unwrap().push(readonly);
            if (readonly && self.refuse_ro) || (!readonly && self.refuse_rw) {
                return Err(DiskError::new(self.refusal, "mount: wrong fs type"));
            }
            self.mounted.store(true, Ordering::SeqCst);
            self.readonly.store(readonly, Ordering::SeqCst);
            Ok(())
        }

        async fn umount(&self) -> Result<(), DiskError> {
            self.mounted.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn fsck(&self) -> Result<(), DiskError> {
            Ok(())
        }

        async fn zerofree(&self) -> Result<(), DiskError> {
            Ok(())
        }

        async fn physical_partition_type(&self) -> Result<PartitionTableType, DiskError> {
            Ok(PartitionTableType::Mbr)
        }
    }

    #[tokio::test]
    async fn refused_read_write_falls_back_to_read_only() {
        let part = FakePartition::new(true, false);
        part.mount().await.unwrap();

        assert!(part.is_mounted());
        assert!(part.is_readonly());
        assert_eq!(*part.attempts.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn read_only_fallback_is_tried_once() {
        let part = FakePartition::new(true, true);
        let error = part.mount().await.unwrap_err();

        assert_eq!(error.kind, DiskErrorKind::CommandFailed);
        assert!(!part.is_mounted());
        assert_eq!(part.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stalled_read_write_mount_is_retried_read_only() {
        let part = FakePartition {
            refusal: DiskErrorKind::Timeout,
            ..FakePartition::new(true, false)
        };
        part.mount().await.unwrap();

        assert!(part.is_readonly());
        assert_eq!(*part.attempts.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn non_mount_errors_are_not_retried_read_only() {
        for refusal in [DiskErrorKind::InvalidInput, DiskErrorKind::Unsupported] {
            let part = FakePartition {
                refusal,
                ..FakePartition::new(true, false)
            };
            let error = part.mount().await.unwrap_err();

            assert_eq!(error.kind, refusal);
            assert!(!part.is_mounted());
            assert_eq!(*part.attempts.lock().unwrap(), vec![false]);
        }
    }

    #[test]
    fn local_path_is_rooted_at_mount_dir() {
        let part = FakePartition::new(false, false);
        assert_eq!(
            part.local_path("/etc/hostname"),
            PathBuf::from("/run/hostdisk/part/etc/hostname")
        );
    }
}
