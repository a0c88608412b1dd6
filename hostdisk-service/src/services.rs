// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use hostdisk_contracts::{CommandRunner, DiskDriver, DiskError};
use hostdisk_guestfs::GuestfsPool;
use hostdisk_sys::{
    Blkid, KeyedLocks, LvmConnectRegistry, LvmTools, MountTools, NbdDeviceRegistry, QemuImg,
    QemuNbd, tool_available,
};
use hostdisk_types::{DiskImage, HostDiskConfig};

use crate::driver::{GuestfsDriver, NbdDriver};
use crate::partition::PartitionEnv;

/// Which mechanism exposes an image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverKind {
    /// guestfish when a pool is running, nbd otherwise
    #[default]
    Auto,
    Nbd,
    Guestfs,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Nbd => "nbd",
            Self::Guestfs => "guestfs",
        })
    }
}

impl FromStr for DriverKind {
    type Err = DiskError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(Self::Auto),
            "nbd" => Ok(Self::Nbd),
            "guestfs" | "guestfish" => Ok(Self::Guestfs),
            other => Err(DiskError::invalid_input(format!("unknown driver {other}"))),
        }
    }
}

/// Process-wide registries and host tool front-ends shared by every driver
pub struct HostDiskServices {
    config: HostDiskConfig,
    runner: Arc<dyn CommandRunner>,
    nbd_devices: Option<Arc<NbdDeviceRegistry>>,
    lvm_registry: Arc<LvmConnectRegistry>,
    guestfs_pool: Option<Arc<GuestfsPool>>,
    qemu_nbd: QemuNbd,
    qemu_img: QemuImg,
    lvm: LvmTools,
    blkid: Blkid,
    partition_env: Arc<PartitionEnv>,
}

impl HostDiskServices {
    /// Probe the host and build whatever backends it supports
    ///
    /// A host without nbd devices or without guestfish still yields a
    /// usable instance; drivers needing the missing backend report
    /// `Unavailable`.
    pub fn build(config: HostDiskConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let nbd_devices = match NbdDeviceRegistry::scan(&config.nbd.dev_dir, &config.nbd.sys_block_dir)
        {
            Ok(registry) => Some(registry),
            Err(error) => {
                warn!("nbd driver disabled: {error}");
                None
            }
        };

        let guestfs_pool = if !config.guestfs.enabled {
            None
        } else if tool_available(&config.guestfs.binary) {
            Some(GuestfsPool::from_config(&config.guestfs))
        } else {
            warn!(binary = %config.guestfs.binary, "guestfs driver disabled: binary not found");
            None
        };

        Self::with_backends(config, runner, nbd_devices, guestfs_pool)
    }

    pub fn with_backends(
        config: HostDiskConfig,
        runner: Arc<dyn CommandRunner>,
        nbd_devices: Option<NbdDeviceRegistry>,
        guestfs_pool: Option<GuestfsPool>,
    ) -> Self {
        let partition_env = Arc::new(PartitionEnv::new(runner.clone(), config.mount.clone()));
        info!(
            nbd_devices = nbd_devices.as_ref().map_or(0, NbdDeviceRegistry::len),
            guestfs = guestfs_pool.is_some(),
            "host disk services ready"
        );

        Self {
            qemu_nbd: QemuNbd::new(
                runner.clone(),
                config.nbd.qemu_nbd.clone(),
                &config.nbd.fork_min_version,
            ),
            qemu_img: QemuImg::new(runner.clone(), config.nbd.qemu_img.clone()),
            lvm: LvmTools::new(runner.clone()),
            blkid: Blkid::new(runner.clone()),
            nbd_devices: nbd_devices.map(Arc::new),
            lvm_registry: Arc::new(LvmConnectRegistry::new()),
            guestfs_pool: guestfs_pool.map(Arc::new),
            partition_env,
            runner,
            config,
        }
    }

    /// Start the idle-worker sweeper when a pool is running
    pub fn start_background_tasks(&self) -> Option<JoinHandle<()>> {
        let pool = self.guestfs_pool.as_ref()?;
        Some(pool.spawn_idle_sweeper(
            self.config.guestfs.sweep_interval(),
            self.config.guestfs.idle_timeout(),
        ))
    }

    /// Resolve `Auto` against the backends present and the image
    pub fn resolve_kind(&self, image: &DiskImage, kind: DriverKind) -> Result<DriverKind, DiskError> {
        match kind {
            DriverKind::Nbd if self.nbd_devices.is_none() => {
                Err(DiskError::unavailable("nbd devices are not available"))
            }
            DriverKind::Guestfs if self.guestfs_pool.is_none() => {
                Err(DiskError::unavailable("guestfish is not available"))
            }
            DriverKind::Guestfs if image.encrypt.is_some() => Err(DiskError::unsupported(
                "encrypted images can only be exposed through nbd",
            )),
            DriverKind::Auto => {
                // secrets and network images are only understood by qemu-nbd
                let guestfs_usable = self.guestfs_pool.is_some()
                    && image.encrypt.is_none()
                    && !image.is_network();
                if guestfs_usable {
                    Ok(DriverKind::Guestfs)
                } else if self.nbd_devices.is_some() {
                    Ok(DriverKind::Nbd)
                } else {
                    Err(DiskError::unavailable("no disk driver is available on this host"))
                }
            }
            kind => Ok(kind),
        }
    }

    /// A disconnected driver for `image`
    pub fn driver_for(
        self: &Arc<Self>,
        image: DiskImage,
        kind: DriverKind,
    ) -> Result<Box<dyn DiskDriver>, DiskError> {
        Ok(match self.resolve_kind(&image, kind)? {
            DriverKind::Guestfs => Box::new(GuestfsDriver::new(self.clone(), image)),
            _ => Box::new(NbdDriver::new(self.clone(), image)),
        })
    }

    /// Terminate pooled workers
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.guestfs_pool {
            pool.shutdown().await;
        }
    }

    pub fn config(&self) -> &HostDiskConfig {
        &self.config
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn nbd_devices(&self) -> Option<&Arc<NbdDeviceRegistry>> {
        self.nbd_devices.as_ref()
    }

    pub fn lvm_registry(&self) -> &Arc<LvmConnectRegistry> {
        &self.lvm_registry
    }

    pub fn guestfs_pool(&self) -> Option<&Arc<GuestfsPool>> {
        self.guestfs_pool.as_ref()
    }

    pub fn qemu_nbd(&self) -> &QemuNbd {
        &self.qemu_nbd
    }

    pub fn qemu_img(&self) -> &QemuImg {
        &self.qemu_img
    }

    pub fn lvm(&self) -> &LvmTools {
        &self.lvm
    }

    pub fn blkid(&self) -> &Blkid {
        &self.blkid
    }

    pub fn partition_env(&self) -> &Arc<PartitionEnv> {
        &self.partition_env
    }

    pub fn mount_tools(&self) -> &MountTools {
        self.partition_env.tools()
    }

    pub fn uuid_locks(&self) -> &KeyedLocks {
        self.partition_env.uuid_locks()
    }
}
