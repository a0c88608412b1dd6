// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{DiskError, DiskErrorKind, DiskPartition};

/// Connect/disconnect lifecycle of one disk image
#[async_trait]
pub trait DiskDriver: Send + Sync {
    /// Expose the image and discover its partitions
    async fn connect(&mut self) -> Result<(), DiskError>;

    /// Undo everything `connect` did; every step runs even if an earlier one fails
    async fn disconnect(&mut self) -> Result<(), DiskError>;

    fn partitions(&self) -> &[Arc<dyn DiskPartition>];

    /// Whether logical volumes were activated for this image
    fn is_lvm(&self) -> bool;

    /// Zero free blocks on every unmounted partition
    async fn zerofree_partitions(&self) -> Result<(), DiskError> {
        let mut failures = Vec::new();
        for part in self.partitions() {
            if part.is_mounted() || !part.fs_type().is_ext() {
                continue;
            }
            if let Err(error) = part.zerofree().await {
                warn!(device = %part.part_dev(), "zerofree failed: {error}");
                failures.push(format!("{}: {}", part.part_dev(), error.message));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DiskError::new(
                DiskErrorKind::CommandFailed,
                format!("zerofree failed on {}", failures.join("; ")),
            ))
        }
    }
}
