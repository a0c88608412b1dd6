// SPDX-License-Identifier: GPL-3.0-only

//! LVM (Logical Volume Manager) types
//!
//! Volume groups found inside a guest image are renamed to a session-local
//! name while active on the host, so the original name is kept alongside.

use serde::{Deserialize, Serialize};

/// What is known about an image chain's use of LVM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LvmClass {
    /// A connect of this image currently has volume groups active
    Lvm,
    /// Proven to contain no LVM physical volumes
    NonLvm,
    Unknown,
}

impl LvmClass {
    /// Whether a connect must hold the per-image lock
    pub fn needs_exclusive_connect(self) -> bool {
        !matches!(self, Self::NonLvm)
    }
}

/// A volume group discovered inside an image partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    /// Stable on-disk UUID
    pub id: String,
    /// Name recorded in the guest's metadata
    pub origin_name: String,
    /// Name currently active on the host
    pub name: String,
    /// Set only when the session rename succeeded
    pub need_rename_back: bool,
    /// Physical partition carrying the group
    pub physical_dev: String,
}

impl VolumeGroup {
    pub fn new(id: impl Into<String>, origin_name: impl Into<String>, physical_dev: &str) -> Self {
        let origin_name = origin_name.into();
        Self {
            id: id.into(),
            name: origin_name.clone(),
            origin_name,
            need_rename_back: false,
            physical_dev: physical_dev.to_string(),
        }
    }

    pub fn is_renamed(&self) -> bool {
        self.name != self.origin_name
    }
}

/// Logical volume inside an active volume group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub vg_name: String,
    pub name: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_group_is_not_renamed() {
        let vg = VolumeGroup::new("abc-123", "centos", "/dev/nbd0p2");
        assert!(!vg.is_renamed());
        assert!(!vg.need_rename_back);
        assert_eq!(vg.name, "centos");
    }

    #[test]
    fn only_non_lvm_skips_the_lock() {
        assert!(LvmClass::Lvm.needs_exclusive_connect());
        assert!(LvmClass::Unknown.needs_exclusive_connect());
        assert!(!LvmClass::NonLvm.needs_exclusive_connect());
    }
}
