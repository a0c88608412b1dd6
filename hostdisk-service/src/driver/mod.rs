// SPDX-License-Identifier: GPL-3.0-only

//! Disk drivers: connect an image, expose its partitions, tear it all down

mod guestfs;
mod nbd;

pub use guestfs::GuestfsDriver;
pub use nbd::NbdDriver;
