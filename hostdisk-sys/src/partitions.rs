// SPDX-License-Identifier: GPL-3.0-only

//! Kernel partition discovery and `blkid` probes

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use hostdisk_contracts::{CommandRunner, DiskError};
use hostdisk_types::{FilesystemType, PartitionTableType};

/// Partition number of `name` when it is `<base>p<N>`
fn partition_number(base: &str, name: &str) -> Option<u32> {
    name.strip_prefix(base)?.strip_prefix('p')?.parse().ok()
}

/// Partition nodes of `device` currently present under `dev_dir`, in order
pub async fn find_partitions(dev_dir: &Path, device: &str) -> Result<Vec<String>, DiskError> {
    let Some(base) = Path::new(device).file_name().and_then(|name| name.to_str()) else {
        return Err(DiskError::invalid_input(format!("bad device path {device}")));
    };

    let mut numbered = Vec::new();
    let mut entries = tokio::fs::read_dir(dev_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(number) = partition_number(base, name) {
            numbered.push((number, entry.path().to_string_lossy().to_string()));
        }
    }

    numbered.sort();
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

/// Poll for partition nodes, which appear asynchronously after a connect
///
/// Waits `base`, `2*base`, `4*base`... between tries. An empty result after
/// the last try is not an error: the disk may hold no partition table.
pub async fn wait_for_partitions(
    dev_dir: &Path,
    device: &str,
    tries: u32,
    base: Duration,
) -> Result<Vec<String>, DiskError> {
    let mut delay = base;
    for attempt in 1..=tries {
        let parts = find_partitions(dev_dir, device).await?;
        if !parts.is_empty() {
            return Ok(parts);
        }
        if attempt < tries {
            debug!(device = %device, attempt, "no partitions yet, waiting {delay:?}");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Ok(Vec::new())
}

pub struct Blkid {
    runner: Arc<dyn CommandRunner>,
}

impl Blkid {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn value(&self, args: &[&str]) -> Option<String> {
        let stdout = self.runner.run_checked("blkid", args).await.ok()?;
        let value = stdout.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    /// Filesystem signature; `Unknown` when there is none
    pub async fn fs_type(&self, device: &str) -> FilesystemType {
        self.value(&["-o", "value", "-s", "TYPE", device])
            .await
            .map(|kind| FilesystemType::parse(&kind))
            .unwrap_or(FilesystemType::Unknown)
    }

    pub async fn uuid(&self, device: &str) -> Option<String> {
        self.value(&["-o", "value", "-s", "UUID", device]).await
    }

    pub async fn partition_table(&self, disk: &str) -> Result<PartitionTableType, DiskError> {
        let pttype = self
            .value(&["-p", "-o", "value", "-s", "PTTYPE", disk])
            .await
            .ok_or_else(|| DiskError::not_found(format!("no partition table on {disk}")))?;
        PartitionTableType::parse(&pttype)
            .ok_or_else(|| DiskError::unsupported(format!("partition table {pttype} on {disk}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdisk_contracts::testing::ScriptedRunner;
    use hostdisk_contracts::{CommandOutput, DiskErrorKind};

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[tokio::test]
    async fn finds_only_this_devices_partitions_in_order() {
        let dev = tempfile::tempdir().unwrap();
        touch(
            dev.path(),
            &["nbd1", "nbd1p10", "nbd1p2", "nbd1p1", "nbd10", "nbd10p1", "nbd1px"],
        );

        let parts = find_partitions(dev.path(), "/dev/nbd1").await.unwrap();
        let names: Vec<_> = parts
            .iter()
            .map(|path| Path::new(path).file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["nbd1p1", "nbd1p2", "nbd1p10"]);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_gives_up_after_the_last_try() {
        let dev = tempfile::tempdir().unwrap();
        touch(dev.path(), &["nbd0"]);

        let started = tokio::time::Instant::now();
        let parts = wait_for_partitions(dev.path(), "/dev/nbd0", 3, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(parts.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn blkid_probes() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| match args {
            [.., "TYPE", "/dev/nbd0p1"] => CommandOutput::ok("xfs\n"),
            [.., "UUID", "/dev/nbd0p1"] => CommandOutput::ok("1b2c-33\n"),
            [.., "PTTYPE", "/dev/nbd0"] => CommandOutput::ok("dos\n"),
            [.., "PTTYPE", "/dev/nbd1"] => CommandOutput::ok("atari\n"),
            _ => CommandOutput::failed(2, ""),
        }));
        let blkid = Blkid::new(runner);

        assert_eq!(blkid.fs_type("/dev/nbd0p1").await, FilesystemType::Xfs);
        assert_eq!(blkid.fs_type("/dev/nbd0p2").await, FilesystemType::Unknown);
        assert_eq!(blkid.uuid("/dev/nbd0p1").await.as_deref(), Some("1b2c-33"));
        assert_eq!(
            blkid.partition_table("/dev/nbd0").await.unwrap(),
            PartitionTableType::Mbr
        );
        assert_eq!(
            blkid.partition_table("/dev/nbd1").await.unwrap_err().kind,
            DiskErrorKind::Unsupported
        );
    }
}
