// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use hostdisk_contracts::{DiskError, DiskPartition};
use hostdisk_types::{FilesystemType, PartitionKind, PartitionTableType, parent_disk_path};

use super::{PartitionEnv, RawPartition};

/// Logical volume of a session-renamed volume group
///
/// Mounting behaves like a [`RawPartition`] on the volume's device path; the
/// partition table is read from the disk under the carrying physical volume.
pub struct LvmPartition {
    inner: RawPartition,
    physical_dev: String,
}

impl LvmPartition {
    pub fn new(
        env: Arc<PartitionEnv>,
        lv_path: impl Into<String>,
        fs_type: FilesystemType,
        uuid: Option<String>,
        physical_dev: impl Into<String>,
    ) -> Self {
        Self {
            inner: RawPartition::with_kind(env, lv_path, fs_type, uuid, PartitionKind::Lvm),
            physical_dev: physical_dev.into(),
        }
    }

    /// Partition holding the physical volume
    pub fn physical_dev(&self) -> &str {
        &self.physical_dev
    }
}

#[async_trait]
impl DiskPartition for LvmPartition {
    fn part_dev(&self) -> &str {
        self.inner.part_dev()
    }

    fn fs_type(&self) -> &FilesystemType {
        self.inner.fs_type()
    }

    fn kind(&self) -> PartitionKind {
        PartitionKind::Lvm
    }

    fn mount_path(&self) -> &Path {
        self.inner.mount_path()
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn is_readonly(&self) -> bool {
        self.inner.is_readonly()
    }

    async fn mount_with(&self, readonly: bool) -> Result<(), DiskError> {
        self.inner.mount_with(readonly).await
    }

    async fn umount(&self) -> Result<(), DiskError> {
        self.inner.umount().await
    }

    async fn fsck(&self) -> Result<(), DiskError> {
        self.inner.fsck().await
    }

    async fn zerofree(&self) -> Result<(), DiskError> {
        self.inner.zerofree().await
    }

    async fn physical_partition_type(&self) -> Result<PartitionTableType, DiskError> {
        self.inner
            .env_blkid()
            .partition_table(parent_disk_path(&self.physical_dev))
            .await
    }
}
