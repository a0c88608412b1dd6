// SPDX-License-Identifier: GPL-3.0-only

pub mod qemu_nbd;
pub mod registry;

pub use qemu_nbd::{QemuNbd, ToolVersion, connect_args};
pub use registry::{DeviceNode, NbdDeviceRegistry};
