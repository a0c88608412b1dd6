// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem type detection results

use std::fmt;

use serde::{Deserialize, Serialize};

/// Filesystem found on a partition or logical volume
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilesystemType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
    Ntfs,
    Swap,
    /// LVM physical volume signature
    LvmMember,
    /// Nothing recognizable on the device
    Unknown,
    Other(String),
}

impl FilesystemType {
    /// Parse the type string reported by `blkid` or `list-filesystems`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ext2" => Self::Ext2,
            "ext3" => Self::Ext3,
            "ext4" => Self::Ext4,
            "xfs" => Self::Xfs,
            "btrfs" => Self::Btrfs,
            "vfat" | "fat" | "fat16" | "fat32" => Self::Vfat,
            "ntfs" | "ntfs-3g" => Self::Ntfs,
            "swap" | "linux-swap" => Self::Swap,
            "lvm2_member" => Self::LvmMember,
            "" | "unknown" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
            Self::Vfat => "vfat",
            Self::Ntfs => "ntfs",
            Self::Swap => "swap",
            Self::LvmMember => "LVM2_member",
            Self::Unknown => "unknown",
            Self::Other(name) => name,
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext3 | Self::Ext4)
    }

    /// Whether a mounted filesystem can be handed to the content layer
    pub fn is_mountable(&self) -> bool {
        !matches!(self, Self::Swap | Self::LvmMember | Self::Unknown)
    }

    /// Cloned images share on-disk UUIDs for these; concurrent mounts must be serialized
    pub fn needs_uuid_lock(&self) -> bool {
        matches!(self, Self::Xfs)
    }

    /// Mounting through the interactive worker is too slow for these
    pub fn is_slow_through_worker(&self) -> bool {
        matches!(self, Self::Ntfs)
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
