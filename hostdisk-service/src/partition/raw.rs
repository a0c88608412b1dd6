// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use hostdisk_contracts::{DiskError, DiskErrorKind, DiskPartition};
use hostdisk_types::{FilesystemType, PartitionKind, PartitionTableType, parent_disk_path};

use super::{MountFlags, PartitionEnv, remove_mount_dir};

#[derive(Default)]
struct MountState {
    mounted: bool,
    /// Held from mount until umount for filesystems that refuse duplicate UUIDs
    uuid_guard: Option<OwnedMutexGuard<()>>,
}

/// Host block device mounted with the host's own tools
pub struct RawPartition {
    env: Arc<PartitionEnv>,
    part_dev: String,
    fs_type: FilesystemType,
    uuid: Option<String>,
    kind: PartitionKind,
    mount_dir: PathBuf,
    flags: MountFlags,
    state: AsyncMutex<MountState>,
}

impl RawPartition {
    pub fn new(
        env: Arc<PartitionEnv>,
        part_dev: impl Into<String>,
        fs_type: FilesystemType,
        uuid: Option<String>,
    ) -> Self {
        Self::with_kind(env, part_dev, fs_type, uuid, PartitionKind::Nbd)
    }

    pub(crate) fn with_kind(
        env: Arc<PartitionEnv>,
        part_dev: impl Into<String>,
        fs_type: FilesystemType,
        uuid: Option<String>,
        kind: PartitionKind,
    ) -> Self {
        let part_dev = part_dev.into();
        Self {
            mount_dir: env.mount_dir_for(&part_dev),
            env,
            part_dev,
            fs_type,
            uuid,
            kind,
            flags: MountFlags::default(),
            state: AsyncMutex::new(MountState::default()),
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub(super) fn env_blkid(&self) -> &hostdisk_sys::Blkid {
        self.env.blkid()
    }

    /// Repair before a read-write mount; failures are logged, never fatal
    async fn repair_before_mount(&self) {
        let attempts = self.env.config().fsck_attempts;
        for attempt in 1..=attempts {
            match self.env.tools().fsck(&self.part_dev, &self.fs_type).await {
                Ok(()) => return,
                Err(error) if error.kind == DiskErrorKind::Unsupported => return,
                Err(error) => {
                    warn!(device = %self.part_dev, attempt, "filesystem check failed: {error}");
                }
            }
        }
        warn!(device = %self.part_dev, "filesystem check kept failing, mounting anyway");
    }

    async fn uuid_lock(&self) -> Option<OwnedMutexGuard<()>> {
        let uuid = self.uuid.as_deref()?;
        if !self.fs_type.needs_uuid_lock() {
            return None;
        }
        debug!(device = %self.part_dev, uuid = %uuid, "waiting for filesystem uuid lock");
        Some(self.env.uuid_locks().lock(uuid).await)
    }
}

#[async_trait]
impl DiskPartition for RawPartition {
    fn part_dev(&self) -> &str {
        &self.part_dev
    }

    fn fs_type(&self) -> &FilesystemType {
        &self.fs_type
    }

    fn kind(&self) -> PartitionKind {
        self.kind
    }

    fn mount_path(&self) -> &Path {
        &self.mount_dir
    }

    fn is_mounted(&self) -> bool {
        self.flags.is_mounted()
    }

    fn is_readonly(&self) -> bool {
        self.flags.is_readonly()
    }

    async fn mount_with(&self, readonly: bool) -> Result<(), DiskError> {
        let mut state = self.state.lock().await;
        if state.mounted {
            return Err(DiskError::invalid_input(format!(
                "{} is already mounted on {}",
                self.part_dev,
                self.mount_dir.display()
            )));
        }
        if !self.fs_type.is_mountable() {
            return Err(DiskError::unsupported(format!(
                "{} holds no mountable filesystem ({})",
                self.part_dev, self.fs_type
            )));
        }

        if !readonly {
            self.repair_before_mount().await;
        }

        // dropped on every failure path below
        let uuid_guard = self.uuid_lock().await;

        let retries = self.env.config().retries.max(1);
        let mut last_error = None;
        for attempt in 1..=retries {
            match self
                .env
                .tools()
                .mount(&self.part_dev, &self.mount_dir, &self.fs_type, readonly)
                .await
            {
                Ok(()) => {
                    state.mounted = true;
                    state.uuid_guard = uuid_guard;
                    self.flags.set_mounted(readonly);
                    return Ok(());
                }
                Err(error) => {
                    warn!(device = %self.part_dev, attempt, "mount failed: {error}");
                    last_error = Some(error);
                    if attempt < retries {
                        tokio::time::sleep(self.env.retry_delay(attempt)).await;
                    }
                }
            }
        }

        remove_mount_dir(&self.mount_dir).await;
        Err(last_error.unwrap_or_else(|| DiskError::internal("mount was never attempted")))
    }

    async fn umount(&self) -> Result<(), DiskError> {
        let mut state = self.state.lock().await;
        if !state.mounted {
            return Ok(());
        }

        let result = self.env.tools().umount(&self.mount_dir).await;
        // the uuid lock never outlives an umount attempt
        state.uuid_guard = None;
        result?;

        state.mounted = false;
        self.flags.set_unmounted();
        remove_mount_dir(&self.mount_dir).await;
        info!(device = %self.part_dev, "partition unmounted");
        Ok(())
    }

    async fn fsck(&self) -> Result<(), DiskError> {
        self.env.tools().fsck(&self.part_dev, &self.fs_type).await
    }

    async fn zerofree(&self) -> Result<(), DiskError> {
        if self.is_mounted() {
            return Err(DiskError::invalid_input(format!(
                "{} must be unmounted for zerofree",
                self.part_dev
            )));
        }
        self.env.tools().zerofree(&self.part_dev, &self.fs_type).await
    }

    async fn physical_partition_type(&self) -> Result<PartitionTableType, DiskError> {
        self.env
            .blkid()
            .partition_table(parent_disk_path(&self.part_dev))
            .await
    }
}
