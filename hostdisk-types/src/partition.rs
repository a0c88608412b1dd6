// SPDX-License-Identifier: GPL-3.0-only

//! Partition-level descriptors

use serde::{Deserialize, Serialize};

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionTableType {
    /// GPT (GUID Partition Table)
    Gpt,

    /// MBR/DOS (Master Boot Record)
    Mbr,
}

impl PartitionTableType {
    /// Name used by `part-disk` and friends
    pub fn as_parted_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Mbr => "mbr",
        }
    }

    /// Parse `blkid` PTTYPE or `part-get-parttype` output
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "gpt" => Some(Self::Gpt),
            "dos" | "mbr" | "msdos" => Some(Self::Mbr),
            _ => None,
        }
    }
}

/// Which mechanism backs a partition handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// Kernel partition of a network-block-device export
    Nbd,
    /// Filesystem seen through an interactive worker
    Guestfs,
    /// Logical volume activated on the host
    Lvm,
}

/// Whole-disk device of a partition node
///
/// `/dev/nbd0p1` -> `/dev/nbd0`, `/dev/sda1` -> `/dev/sda`. Paths without a
/// partition suffix are returned unchanged.
pub fn parent_disk_path(part_dev: &str) -> &str {
    let trimmed = part_dev.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == part_dev.len() {
        return part_dev;
    }

    if let Some(base) = trimmed.strip_suffix('p')
        && base.ends_with(|c: char| c.is_ascii_digit())
    {
        return base;
    }

    // numbered disks use a `p` separator, so bare trailing digits are the disk number
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if NUMBERED_DISK_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        return part_dev;
    }

    trimmed
}

const NUMBERED_DISK_PREFIXES: &[&str] = &["nbd", "loop", "nvme", "mmcblk"];
