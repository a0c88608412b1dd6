// SPDX-License-Identifier: GPL-3.0-only

pub mod error;
pub mod teardown;

pub use error::{DiskError, DiskErrorKind, Result};
pub use teardown::TeardownErrors;
