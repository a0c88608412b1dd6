// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use hostdisk_contracts::DiskError;

/// One host network-block-device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceNode {
    pub path: String,
    pub busy: bool,
}

/// Fixed table of `/dev/nbdN` nodes with busy tracking
#[derive(Debug)]
pub struct NbdDeviceRegistry {
    sys_block_dir: PathBuf,
    devices: Mutex<Vec<DeviceNode>>,
}

impl NbdDeviceRegistry {
    /// Enumerate `nbd0`, `nbd1`, ... under `dev_dir` until the first gap
    pub fn scan(dev_dir: &Path, sys_block_dir: &Path) -> Result<Self, DiskError> {
        let mut devices = Vec::new();
        loop {
            let path = dev_dir.join(format!("nbd{}", devices.len()));
            if !path.exists() {
                break;
            }
            devices.push(DeviceNode {
                path: path.to_string_lossy().to_string(),
                busy: false,
            });
        }

        if devices.is_empty() {
            return Err(DiskError::not_found(format!(
                "no nbd devices under {}, is the nbd module loaded?",
                dev_dir.display()
            )));
        }

        info!(count = devices.len(), "nbd devices found");
        Ok(Self {
            sys_block_dir: sys_block_dir.to_path_buf(),
            devices: Mutex::new(devices),
        })
    }

    /// Take a free device, or `None` when every device is busy
    pub fn allocate(&self) -> Option<String> {
        let mut devices = self.lock_devices();
        for device in devices.iter_mut().filter(|device| !device.busy) {
            if self.in_use_by_host(&device.path) {
                debug!(device = %device.path, "skipping nbd device attached outside the registry");
                continue;
            }
            device.busy = true;
            debug!(device = %device.path, "nbd device allocated");
            return Some(device.path.clone());
        }
        warn!("no free nbd device");
        None
    }

    /// Mark a device free again; unknown paths are ignored
    pub fn release(&self, path: &str) {
        let mut devices = self.lock_devices();
        if let Some(device) = devices.iter_mut().find(|device| device.path == path) {
            device.busy = false;
            debug!(device = %path, "nbd device released");
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceNode> {
        self.lock_devices().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_devices().is_empty()
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, Vec<DeviceNode>> {
        // the table stays consistent even if a holder panicked
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A connected nbd device has a client pid or a non-zero size in sysfs
    fn in_use_by_host(&self, path: &str) -> bool {
        let Some(name) = Path::new(path).file_name() else {
            return false;
        };
        let sys_dir = self.sys_block_dir.join(name);
        if sys_dir.join("pid").exists() {
            return true;
        }
        std::fs::read_to_string(sys_dir.join("size"))
            .ok()
            .and_then(|size| size.trim().parse::<u64>().ok())
            .is_some_and(|size| size > 0)
    }
}
