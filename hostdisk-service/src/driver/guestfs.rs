// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hostdisk_contracts::{DiskDriver, DiskError, DiskPartition, TeardownErrors};
use hostdisk_guestfs::{Guestfish, GuestfsPool};
use hostdisk_types::{DiskImage, FilesystemType, PartitionTableType, parent_disk_path};

use super::NbdDriver;
use crate::partition::GuestfsPartition;
use crate::services::HostDiskServices;

/// What a freshly attached drive turned out to need
enum Attached {
    Ready {
        partitions: Vec<Arc<dyn DiskPartition>>,
        lvm: bool,
    },
    /// Contents are too slow to serve through the worker
    NeedsNbd,
}

/// Looks into an image through a pooled guestfish worker
///
/// Images whose only filesystems are slow through the worker (NTFS without
/// any logical volume) are handed to an [`NbdDriver`] instead; the worker goes
/// back to the pool untouched.
pub struct GuestfsDriver {
    services: Arc<HostDiskServices>,
    image: DiskImage,
    fish: Option<Arc<Guestfish>>,
    label: String,
    partitions: Vec<Arc<dyn DiskPartition>>,
    lvm: bool,
    fallback: Option<NbdDriver>,
}

impl GuestfsDriver {
    pub fn new(services: Arc<HostDiskServices>, image: DiskImage) -> Self {
        Self {
            services,
            image,
            fish: None,
            label: String::new(),
            partitions: Vec::new(),
            lvm: false,
            fallback: None,
        }
    }

    /// Whether the image ended up exposed through nbd
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    fn pool(&self) -> Result<Arc<GuestfsPool>, DiskError> {
        self.services
            .guestfs_pool()
            .cloned()
            .ok_or_else(|| DiskError::unavailable("guestfish is not available"))
    }

    fn worker(&self) -> Result<&Arc<Guestfish>, DiskError> {
        self.fish.as_ref().ok_or_else(|| {
            if self.fallback.is_some() {
                DiskError::unsupported(format!("{} is exposed through nbd", self.image.path))
            } else {
                DiskError::invalid_input(format!("{} is not connected", self.image.path))
            }
        })
    }

    async fn attach(&self, fish: &Arc<Guestfish>, label: &str) -> Result<Attached, DiskError> {
        fish.add_drive(&self.image.path, label, false).await?;
        fish.lvm_clear_filter().await?;
        let filesystems = fish.list_filesystems().await?;
        let volumes = fish.lvs().await?;

        let slow = filesystems.values().any(FilesystemType::is_slow_through_worker);
        if slow && volumes.is_empty() {
            return Ok(Attached::NeedsNbd);
        }

        let env = self.services.partition_env();
        let mut tables: BTreeMap<String, Option<PartitionTableType>> = BTreeMap::new();
        let mut partitions: Vec<Arc<dyn DiskPartition>> = Vec::new();
        for (device, fs_type) in filesystems {
            if !fs_type.is_mountable() {
                debug!(device = %device, fs = %fs_type, "skipping filesystem");
                continue;
            }
            // read now: the worker answers nothing else while a partition is mounted
            let disk = parent_disk_path(&device).to_string();
            let table_type = match tables.get(&disk) {
                Some(table_type) => *table_type,
                None => {
                    let table_type = match fish.part_get_parttype(&disk).await {
                        Ok(table_type) => Some(table_type),
                        Err(error) => {
                            debug!(disk = %disk, "no partition table: {error}");
                            None
                        }
                    };
                    tables.insert(disk, table_type);
                    table_type
                }
            };
            partitions.push(Arc::new(
                GuestfsPartition::new(fish.clone(), env.clone(), device, fs_type, label)
                    .with_table_type(table_type),
            ));
        }

        Ok(Attached::Ready {
            partitions,
            lvm: !volumes.is_empty(),
        })
    }

    /// Write a fresh partition table holding one partition across `device`
    pub async fn make_partition_table(
        &self,
        device: &str,
        table: PartitionTableType,
    ) -> Result<(), DiskError> {
        self.worker()?.part_disk(device, table).await
    }

    /// Create a filesystem (or swap area) on `device`
    pub async fn format_partition(
        &self,
        device: &str,
        fs_type: &FilesystemType,
        label: Option<&str>,
    ) -> Result<(), DiskError> {
        let fish = self.worker()?;
        match fs_type {
            FilesystemType::Swap => fish.mkswap(device, label).await,
            FilesystemType::LvmMember | FilesystemType::Unknown => Err(DiskError::unsupported(
                format!("cannot format {device} as {fs_type}"),
            )),
            fs_type => fish.mkfs(fs_type, device).await,
        }
    }

    /// Block devices the worker sees for the attached image
    pub async fn list_devices(&self) -> Result<Vec<String>, DiskError> {
        self.worker()?.list_devices().await
    }

    /// Probe tags (`TYPE`, `UUID`, `LABEL`...) of a device inside the worker
    pub async fn blkid(&self, device: &str) -> Result<BTreeMap<String, String>, DiskError> {
        self.worker()?.blkid(device).await
    }
}

#[async_trait]
impl DiskDriver for GuestfsDriver {
    async fn connect(&mut self) -> Result<(), DiskError> {
        if self.fish.is_some() || self.fallback.is_some() {
            return Err(DiskError::invalid_input(format!(
                "{} is already connected",
                self.image.path
            )));
        }

        let pool = self.pool()?;
        let fish = pool.acquire().await?;
        let label = format!("hd{}", Uuid::new_v4().simple());

        match self.attach(&fish, &label).await {
            Ok(Attached::Ready { partitions, lvm }) => {
                info!(
                    image = %self.image.path,
                    fish = fish.id(),
                    partitions = partitions.len(),
                    lvm,
                    "image attached to guestfish"
                );
                self.fish = Some(fish);
                self.label = label;
                self.partitions = partitions;
                self.lvm = lvm;
                Ok(())
            }
            Ok(Attached::NeedsNbd) => {
                info!(image = %self.image.path, "ntfs without logical volumes, switching to nbd");
                pool.release(fish).await;

                let mut nbd = NbdDriver::new(self.services.clone(), self.image.clone());
                nbd.connect().await?;
                self.fallback = Some(nbd);
                Ok(())
            }
            Err(error) => {
                warn!(image = %self.image.path, "attaching to guestfish failed: {error}");
                pool.release(fish).await;
                Err(error)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), DiskError> {
        if let Some(mut nbd) = self.fallback.take() {
            return nbd.disconnect().await;
        }

        let mut errors = TeardownErrors::new();
        for part in self.partitions.drain(..) {
            if part.is_mounted() {
                errors.check(format!("umount {}", part.part_dev()), part.umount().await);
            }
        }
        self.lvm = false;

        if let Some(fish) = self.fish.take() {
            // washing detaches the drive before the worker is reused
            match self.services.guestfs_pool() {
                Some(pool) => pool.release(fish).await,
                None => fish.terminate().await,
            }
            info!(image = %self.image.path, label = %self.label, "image detached from guestfish");
        }
        self.label.clear();

        errors.into_result()
    }

    fn partitions(&self) -> &[Arc<dyn DiskPartition>] {
        match &self.fallback {
            Some(nbd) => nbd.partitions(),
            None => &self.partitions,
        }
    }

    fn is_lvm(&self) -> bool {
        match &self.fallback {
            Some(nbd) => nbd.is_lvm(),
            None => self.lvm,
        }
    }
}
