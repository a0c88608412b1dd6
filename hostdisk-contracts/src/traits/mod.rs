// SPDX-License-Identifier: GPL-3.0-only

pub mod command;
pub mod driver;
pub mod partition;

pub use command::{CommandOutput, CommandRunner, render_command};
pub use driver::DiskDriver;
pub use partition::DiskPartition;
