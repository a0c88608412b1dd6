// SPDX-License-Identifier: GPL-3.0-only

//! Host-side introspection of guest disk images
//!
//! An image is connected through one of two drivers:
//!
//! - [`NbdDriver`]: `qemu-nbd` exposes the image as a host block device, its
//!   volume groups are activated under session names and partitions are
//!   mounted with the host's own tools
//! - [`GuestfsDriver`]: a pooled guestfish worker attaches the image and
//!   serves its filesystems to the host over FUSE
//!
//! [`HostDiskServices`] owns everything shared between connects.

pub mod driver;
pub mod logging;
pub mod partition;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

pub use driver::{GuestfsDriver, NbdDriver};
pub use partition::{
    DeviceChangeProbe, GuestfsPartition, LvmPartition, MountProbe, PartitionEnv, RawPartition,
};
pub use services::{DriverKind, HostDiskServices};
