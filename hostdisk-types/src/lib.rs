// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for host-side disk image introspection
//!
//! These models are shared by every layer of the stack:
//!
//! - **hostdisk-sys**: parses host tool output into these types
//! - **hostdisk-guestfs**: reports worker-side filesystems with them
//! - **hostdisk-service**: builds partition handles and drivers from them
//!
//! Configuration for the whole process lives here as well, so that the
//! lower crates can take their knobs without depending on the service.

pub mod config;
pub mod filesystem;
pub mod image;
pub mod lvm;
pub mod partition;

pub use config::{
    ConfigError, GuestfsConfig, HostDiskConfig, LogConfig, LvmConfig, MountConfig, NbdConfig,
};
pub use filesystem::FilesystemType;
pub use image::{DiskImage, EncryptInfo, ImageInfo, is_network_path, root_backing_path};
pub use lvm::{LogicalVolume, LvmClass, VolumeGroup};
pub use partition::{PartitionKind, PartitionTableType, parent_disk_path};
