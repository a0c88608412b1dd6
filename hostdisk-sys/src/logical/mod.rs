// SPDX-License-Identifier: GPL-3.0-only

pub mod lvm_tools;

pub use lvm_tools::{LvmTools, PvGroup};
