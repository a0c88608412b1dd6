// SPDX-License-Identifier: GPL-3.0-only

//! guestfish as a pooled, long-lived worker
//!
//! [`Guestfish`] drives one guestfish process over a pseudo-terminal using
//! its prompt-echo line protocol. [`WorkerPool`] bounds how many of them run
//! at once and recycles them between requests.

pub mod fish;
pub mod framing;
pub mod pool;

pub use fish::Guestfish;
pub use framing::{ResponseFramer, strip_terminal_noise};
pub use pool::{GuestfishLauncher, GuestfsPool, PoolWorker, WorkerLauncher, WorkerPool};
