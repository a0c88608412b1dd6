// SPDX-License-Identifier: GPL-3.0-only

//! Host-side tooling for disk image introspection
//!
//! Everything that touches the host directly lives here:
//! - The `/dev/nbdN` device table and the `qemu-nbd` / `qemu-img` front-ends
//! - LVM command-line tools and the per-image connect registry
//! - Kernel partition discovery, `blkid` probes and mount/repair commands
//!
//! Commands are always issued through a [`CommandRunner`], so callers
//! (and tests) decide how they are executed.
//!
//! [`CommandRunner`]: hostdisk_contracts::CommandRunner

pub mod command;
pub mod locks;
pub mod logical;
pub mod mount;
pub mod nbd;
pub mod partitions;
pub mod qemu_img;

pub use command::{HostCommandRunner, tool_available};
pub use locks::{ImageConnectGuard, KeyedLocks, LvmConnectRegistry};
pub use logical::{LvmTools, PvGroup};
pub use mount::{MountTools, ToolCommand};
pub use nbd::{DeviceNode, NbdDeviceRegistry, QemuNbd, ToolVersion};
pub use partitions::{Blkid, find_partitions, wait_for_partitions};
pub use qemu_img::{ImageProbe, QemuImg};
