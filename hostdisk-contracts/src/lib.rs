// SPDX-License-Identifier: GPL-3.0-only

pub mod protocol;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use protocol::{DiskError, DiskErrorKind, Result, TeardownErrors};
pub use traits::{CommandOutput, CommandRunner, DiskDriver, DiskPartition, render_command};
