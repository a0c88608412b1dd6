// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hostdisk_contracts::{DiskError, DiskPartition, TeardownErrors};
use hostdisk_guestfs::Guestfish;
use hostdisk_types::{FilesystemType, PartitionKind, PartitionTableType, parent_disk_path};

use super::{MountFlags, PartitionEnv, mount_dir_name, remove_mount_dir};

const PROBE_INTERVAL: Duration = Duration::from_millis(100);

type RunTask = JoinHandle<Result<(), DiskError>>;

#[derive(Default)]
struct FuseState {
    mounted: bool,
    /// `mount-local-run`, which blocks the worker until the host view is unmounted
    run_task: Option<RunTask>,
}

/// Filesystem inside a guestfish appliance, exposed on the host through FUSE
///
/// A worker serves a single FUSE view at a time and takes no other command
/// meanwhile, so only one partition of a worker can be mounted at once. The
/// partition table type is best read at connect time through
/// [`GuestfsPartition::with_table_type`].
pub struct GuestfsPartition {
    fish: Arc<Guestfish>,
    env: Arc<PartitionEnv>,
    part_dev: String,
    fs_type: FilesystemType,
    table_type: Option<PartitionTableType>,
    mount_dir: PathBuf,
    flags: MountFlags,
    state: AsyncMutex<FuseState>,
}

impl GuestfsPartition {
    /// `label` is the drive label, which keeps mount points of different
    /// workers apart since all of them name their disk `/dev/sda`
    pub fn new(
        fish: Arc<Guestfish>,
        env: Arc<PartitionEnv>,
        part_dev: impl Into<String>,
        fs_type: FilesystemType,
        label: &str,
    ) -> Self {
        let part_dev = part_dev.into();
        let mount_dir = env
            .config()
            .root
            .join(format!("{label}-{}", mount_dir_name(&part_dev)));
        Self {
            fish,
            env,
            part_dev,
            fs_type,
            table_type: None,
            mount_dir,
            flags: MountFlags::default(),
            state: AsyncMutex::new(FuseState::default()),
        }
    }

    pub fn with_table_type(mut self, table_type: Option<PartitionTableType>) -> Self {
        self.table_type = table_type;
        self
    }

    async fn repair_before_mount(&self) {
        for attempt in 1..=self.env.config().fsck_attempts {
            match self.fish.fsck(&self.fs_type, &self.part_dev).await {
                Ok(0) => return,
                Ok(status) => {
                    warn!(device = %self.part_dev, attempt, status, "filesystem check reported problems");
                }
                Err(error) => {
                    warn!(device = %self.part_dev, attempt, "filesystem check failed: {error}");
                }
            }
        }
        warn!(device = %self.part_dev, "filesystem check kept failing, mounting anyway");
    }

    async fn wait_until_visible(&self, run_task: &RunTask) -> Result<(), DiskError> {
        let probe = async {
            loop {
                if run_task.is_finished() {
                    return Err(DiskError::command_failed(
                        "mount-local-run",
                        "exited before the mount became visible",
                    ));
                }
                if self.env.mount_probe().is_mounted(&self.mount_dir).await {
                    return Ok(());
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        };

        timeout(self.env.config().probe_timeout(), probe)
            .await
            .map_err(|_| {
                DiskError::timeout(format!(
                    "{} did not appear on {}",
                    self.part_dev,
                    self.mount_dir.display()
                ))
            })?
    }

    /// Wait for `mount-local-run` to return; a worker stuck in it is killed
    async fn stop_run_task(&self, mut task: RunTask) -> Result<(), DiskError> {
        match timeout(self.env.config().probe_timeout(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DiskError::internal(format!(
                "mount-local-run task failed: {join_error}"
            ))),
            Err(_) => {
                task.abort();
                // the response stream is out of step now
                self.fish.terminate().await;
                Err(DiskError::timeout(format!(
                    "guestfish {} kept serving {}",
                    self.fish.id(),
                    self.mount_dir.display()
                )))
            }
        }
    }

    async fn expose(&self, readonly: bool, state: &mut FuseState) -> Result<(), DiskError> {
        tokio::fs::create_dir_all(&self.mount_dir).await?;
        self.fish
            .mount_local(&self.mount_dir.to_string_lossy(), readonly)
            .await?;

        let fish = self.fish.clone();
        let task = tokio::spawn(async move { fish.mount_local_run().await });

        if let Err(error) = self.wait_until_visible(&task).await {
            if let Err(umount_error) = self.env.tools().umount(&self.mount_dir).await {
                debug!(dir = %self.mount_dir.display(), "host umount after failed probe: {umount_error}");
            }
            if let Err(run_error) = self.stop_run_task(task).await {
                debug!(device = %self.part_dev, "mount-local-run: {run_error}");
            }
            return Err(error);
        }

        state.run_task = Some(task);
        Ok(())
    }
}

#[async_trait]
impl DiskPartition for GuestfsPartition {
    fn part_dev(&self) -> &str {
        &self.part_dev
    }

    fn fs_type(&self) -> &FilesystemType {
        &self.fs_type
    }

    fn kind(&self) -> PartitionKind {
        PartitionKind::Guestfs
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
        if self.fish.is_serving() {
            return Err(DiskError::invalid_input(format!(
                "guestfish {} already serves another partition, unmount it before {}",
                self.fish.id(),
                self.part_dev
            )));
        }

        if !readonly {
            self.repair_before_mount().await;
        }

        self.fish.mount(&self.part_dev, "/", readonly).await?;
        if let Err(error) = self.expose(readonly, &mut state).await {
            if let Err(cleanup) = self.fish.umount_all().await {
                warn!(device = %self.part_dev, "umount-all after failed mount: {cleanup}");
            }
            remove_mount_dir(&self.mount_dir).await;
            return Err(error);
        }

        state.mounted = true;
        self.flags.set_mounted(readonly);
        info!(
            device = %self.part_dev,
            dir = %self.mount_dir.display(),
            readonly,
            fish = self.fish.id(),
            "mounted through guestfish"
        );
        Ok(())
    }

    async fn umount(&self) -> Result<(), DiskError> {
        let mut state = self.state.lock().await;
        if !state.mounted {
            return Ok(());
        }

        let mut errors = TeardownErrors::new();
        errors.check(
            format!("umount {}", self.mount_dir.display()),
            self.env.tools().umount(&self.mount_dir).await,
        );
        if let Some(task) = state.run_task.take() {
            errors.check("mount-local-run", self.stop_run_task(task).await);
        }
        errors.check("umount-all", self.fish.umount_all().await);

        state.mounted = false;
        self.flags.set_unmounted();
        remove_mount_dir(&self.mount_dir).await;
        errors.into_result()
    }

    async fn fsck(&self) -> Result<(), DiskError> {
        match self.fish.fsck(&self.fs_type, &self.part_dev).await? {
            0 => Ok(()),
            status => Err(DiskError::command_failed(
                &format!("fsck {} {}", self.fs_type, self.part_dev),
                format!("exit status {status}"),
            )),
        }
    }

    async fn zerofree(&self) -> Result<(), DiskError> {
        if self.is_mounted() {
            return Err(DiskError::invalid_input(format!(
                "{} must be unmounted for zerofree",
                self.part_dev
            )));
        }
        if !self.fs_type.is_ext() {
            return Err(DiskError::unsupported(format!(
                "zerofree does not support {}",
                self.fs_type
            )));
        }
        self.fish.zerofree(&self.part_dev).await
    }

    async fn physical_partition_type(&self) -> Result<PartitionTableType, DiskError> {
        if let Some(table_type) = self.table_type {
            return Ok(table_type);
        }
        self.fish
            .part_get_parttype(parent_disk_path(&self.part_dev))
            .await
    }
}
