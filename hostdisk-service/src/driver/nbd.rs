// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hostdisk_contracts::{DiskDriver, DiskError, DiskPartition, TeardownErrors};
use hostdisk_sys::{ImageConnectGuard, NbdDeviceRegistry, wait_for_partitions};
use hostdisk_types::{DiskImage, LvmClass, VolumeGroup};

use crate::partition::{LvmPartition, RawPartition};
use crate::services::HostDiskServices;

/// Host-unique volume group name for the lifetime of one connect
fn session_vg_name() -> String {
    format!("hd{}", Uuid::new_v4().simple())
}

/// Exposes an image as a host block device through `qemu-nbd`
pub struct NbdDriver {
    services: Arc<HostDiskServices>,
    image: DiskImage,
    device: Option<String>,
    image_guard: Option<ImageConnectGuard>,
    volume_groups: Vec<VolumeGroup>,
    partitions: Vec<Arc<dyn DiskPartition>>,
    lvm: bool,
}

impl NbdDriver {
    pub fn new(services: Arc<HostDiskServices>, image: DiskImage) -> Self {
        Self {
            services,
            image,
            device: None,
            image_guard: None,
            volume_groups: Vec::new(),
            partitions: Vec::new(),
            lvm: false,
        }
    }

    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    /// Host device while connected
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn volume_groups(&self) -> &[VolumeGroup] {
        &self.volume_groups
    }

    fn registry(&self) -> Result<Arc<NbdDeviceRegistry>, DiskError> {
        self.services
            .nbd_devices()
            .cloned()
            .ok_or_else(|| DiskError::unavailable("nbd devices are not available"))
    }

    async fn attach(&mut self) -> Result<(), DiskError> {
        let registry = self.registry()?;
        let probe = self.services.qemu_img().probe(&self.image).await?;
        let backing = probe.backing_path().to_string();

        let class = self.services.lvm_registry().classify(&backing);
        if class.needs_exclusive_connect() {
            self.image_guard = Some(self.services.lvm_registry().acquire(&backing).await);
        }

        let device = registry.allocate().ok_or_else(|| {
            DiskError::exhausted(format!("no free nbd device for {}", self.image.path))
        })?;
        self.device = Some(device.clone());

        self.services
            .qemu_nbd()
            .connect(&device, &self.image, &probe)
            .await?;

        let nbd = &self.services.config().nbd;
        let parts = wait_for_partitions(
            &nbd.dev_dir,
            &device,
            nbd.partition_probe_tries,
            nbd.partition_probe_base(),
        )
        .await?;
        if parts.is_empty() {
            warn!(device = %device, image = %self.image.path, "no partitions found");
        }

        let env = self.services.partition_env().clone();
        for part in &parts {
            let fs_type = self.services.blkid().fs_type(part).await;
            if !fs_type.is_mountable() {
                debug!(device = %part, fs = %fs_type, "skipping partition");
                continue;
            }
            let uuid = self.services.blkid().uuid(part).await;
            self.partitions
                .push(Arc::new(RawPartition::new(env.clone(), part, fs_type, uuid)));
        }

        if class != LvmClass::NonLvm {
            self.activate_volume_groups(&parts).await;
            if self.lvm {
                if let Some(guard) = &self.image_guard {
                    guard.mark_lvm();
                }
            } else if !parts.is_empty() {
                self.services.lvm_registry().cache_non_lvm(&backing);
            }
        }

        info!(
            image = %self.image.path,
            device = %device,
            partitions = self.partitions.len(),
            lvm = self.lvm,
            "image connected through nbd"
        );
        Ok(())
    }

    /// Rename, activate and enumerate every volume group on `parts`
    async fn activate_volume_groups(&mut self, parts: &[String]) {
        let lvm = self.services.lvm();
        if let Err(error) = lvm.pvscan().await {
            warn!("pvscan failed: {error}");
        }

        let mut seen = HashSet::new();
        for part in parts {
            let Some(group) = lvm.pv_group(part).await else {
                continue;
            };
            if !seen.insert(group.vg_uuid.clone()) {
                continue;
            }

            let mut vg = VolumeGroup::new(group.vg_uuid, group.vg_name, part);
            let session_name = session_vg_name();
            match lvm.rename_vg(&vg.id, &session_name).await {
                Ok(()) => {
                    vg.name = session_name;
                    vg.need_rename_back = true;
                }
                Err(error) => {
                    warn!(vg = %vg.origin_name, "session rename failed, keeping the guest name: {error}");
                }
            }
            // recorded before activation so teardown covers a partial setup
            self.volume_groups.push(vg.clone());
            self.lvm = true;

            if let Err(error) = lvm.activate(&vg.name).await {
                warn!(vg = %vg.name, "activation failed: {error}");
                continue;
            }
            if let Err(error) = lvm.refresh(&vg.name).await {
                warn!(vg = %vg.name, "refresh failed: {error}");
            }

            let mut volumes = lvm.logical_volumes(&vg.name).await;
            if volumes.is_empty() {
                tokio::time::sleep(self.services.config().lvm.lv_retry_delay()).await;
                volumes = lvm.logical_volumes(&vg.name).await;
            }

            let env = self.services.partition_env();
            for volume in volumes {
                let fs_type = self.services.blkid().fs_type(&volume.path).await;
                if !fs_type.is_mountable() {
                    debug!(lv = %volume.path, fs = %fs_type, "skipping logical volume");
                    continue;
                }
                let uuid = self.services.blkid().uuid(&volume.path).await;
                self.partitions.push(Arc::new(LvmPartition::new(
                    env.clone(),
                    volume.path,
                    fs_type,
                    uuid,
                    vg.physical_dev.clone(),
                )));
            }
        }
    }
}

#[async_trait]
impl DiskDriver for NbdDriver {
    async fn connect(&mut self) -> Result<(), DiskError> {
        if self.device.is_some() {
            return Err(DiskError::invalid_input(format!(
                "{} is already connected",
                self.image.path
            )));
        }

        if let Err(error) = self.attach().await {
            if let Err(teardown) = self.disconnect().await {
                warn!(image = %self.image.path, "cleanup after failed connect: {teardown}");
            }
            return Err(error);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DiskError> {
        let mut errors = TeardownErrors::new();

        for part in self.partitions.drain(..) {
            if part.is_mounted() {
                errors.check(format!("umount {}", part.part_dev()), part.umount().await);
            }
        }

        let lvm = self.services.lvm();
        for vg in self.volume_groups.drain(..) {
            errors.check(format!("deactivate {}", vg.name), lvm.deactivate(&vg.name).await);
            if vg.need_rename_back {
                errors.check(
                    format!("rename {} back to {}", vg.name, vg.origin_name),
                    lvm.rename_vg(&vg.id, &vg.origin_name).await,
                );
            }
        }
        self.lvm = false;
        self.image_guard = None;

        if let Some(device) = self.device.take() {
            errors.check(
                format!("qemu-nbd -d {device}"),
                self.services.qemu_nbd().disconnect(&device).await,
            );
            if let Some(registry) = self.services.nbd_devices() {
                registry.release(&device);
            }
            info!(image = %self.image.path, device = %device, "image disconnected");
        }

        errors.into_result()
    }

    fn partitions(&self) -> &[Arc<dyn DiskPartition>] {
        &self.partitions
    }

    fn is_lvm(&self) -> bool {
        self.lvm
    }
}
