// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use tracing::{debug, warn};

use hostdisk_contracts::{CommandRunner, DiskError};
use hostdisk_types::LogicalVolume;

/// Volume group a physical volume belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvGroup {
    pub vg_name: String,
    pub vg_uuid: String,
}

fn parse_tabbed_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|part| part.trim().to_string())
        .collect()
}

fn parse_pv_group(output: &str) -> Option<PvGroup> {
    output.lines().find_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let cols = parse_tabbed_line(line);
        if cols.len() < 2 || cols[0].is_empty() || cols[1].is_empty() {
            return None;
        }
        Some(PvGroup {
            vg_name: cols[0].clone(),
            vg_uuid: cols[1].clone(),
        })
    })
}

fn parse_lvs(vg_name: &str, output: &str) -> Vec<LogicalVolume> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 2 || cols[1].is_empty() {
                return None;
            }
            Some(LogicalVolume {
                vg_name: vg_name.to_string(),
                name: cols[0].clone(),
                path: cols[1].clone(),
            })
        })
        .collect()
}

fn parse_vgs(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Host LVM command-line tools
pub struct LvmTools {
    runner: Arc<dyn CommandRunner>,
}

impl LvmTools {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Rescan block devices for physical volumes
    pub async fn pvscan(&self) -> Result<(), DiskError> {
        self.runner.run_checked("pvscan", &[]).await.map(|_| ())
    }

    /// Volume group carried by `device`, if it is a physical volume
    pub async fn pv_group(&self, device: &str) -> Option<PvGroup> {
        let output = self
            .runner
            .run_checked(
                "pvs",
                &[
                    "--noheadings",
                    "-o",
                    "vg_name,vg_uuid",
                    "--separator",
                    "\t",
                    device,
                ],
            )
            .await;
        match output {
            Ok(stdout) => parse_pv_group(&stdout),
            Err(error) => {
                debug!(device = %device, "not a physical volume: {error}");
                None
            }
        }
    }

    /// Rename by uuid so that a same-named group on the host is never touched
    pub async fn rename_vg(&self, vg_uuid: &str, new_name: &str) -> Result<(), DiskError> {
        self.runner
            .run_checked("vgrename", &[vg_uuid, new_name])
            .await
            .map(|_| ())
    }

    pub async fn activate(&self, vg_name: &str) -> Result<(), DiskError> {
        self.runner
            .run_checked("vgchange", &["-ay", vg_name])
            .await
            .map(|_| ())
    }

    pub async fn deactivate(&self, vg_name: &str) -> Result<(), DiskError> {
        self.runner
            .run_checked("vgchange", &["-an", vg_name])
            .await
            .map(|_| ())
    }

    pub async fn refresh(&self, vg_name: &str) -> Result<(), DiskError> {
        self.runner
            .run_checked("vgchange", &["--refresh", vg_name])
            .await
            .map(|_| ())
    }

    /// Logical volumes of an active group; empty when the tool fails
    pub async fn logical_volumes(&self, vg_name: &str) -> Vec<LogicalVolume> {
        let output = self
            .runner
            .run_checked(
                "lvs",
                &[
                    "--noheadings",
                    "-o",
                    "lv_name,lv_path",
                    "--separator",
                    "\t",
                    vg_name,
                ],
            )
            .await;
        match output {
            Ok(stdout) => parse_lvs(vg_name, &stdout),
            Err(error) => {
                warn!(vg = %vg_name, "listing logical volumes failed: {error}");
                Vec::new()
            }
        }
    }

    /// Names of every volume group known to the host
    pub async fn volume_groups(&self) -> Vec<String> {
        match self
            .runner
            .run_checked("vgs", &["--noheadings", "-o", "vg_name"])
            .await
        {
            Ok(stdout) => parse_vgs(&stdout),
            Err(error) => {
                warn!("listing volume groups failed: {error}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdisk_contracts::CommandOutput;
    use hostdisk_contracts::testing::ScriptedRunner;

    #[test]
    fn parses_lvm_outputs() {
        let group = parse_pv_group("  centos\tWd3kZp-0aBc-1234\n").unwrap();
        assert_eq!(group.vg_name, "centos");
        assert_eq!(group.vg_uuid, "Wd3kZp-0aBc-1234");

        let lvs = parse_lvs("centos", "  root\t/dev/centos/root\n  swap\t/dev/centos/swap\n");
        assert_eq!(lvs.len(), 2);
        assert_eq!(lvs[1].path, "/dev/centos/swap");
        assert_eq!(lvs[0].vg_name, "centos");

        assert_eq!(parse_vgs("  vg0\n  centos\n\n"), vec!["vg0", "centos"]);
    }

    #[test]
    fn unparsable_rows_are_not_found() {
        assert_eq!(parse_pv_group("  \t\n"), None);
        assert_eq!(parse_pv_group("garbage"), None);
        assert!(parse_lvs("vg0", "root\n").is_empty());
    }

    #[tokio::test]
    async fn failing_pvs_means_no_group() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            CommandOutput::failed(5, "Failed to find physical volume")
        }));
        let lvm = LvmTools::new(runner.clone());

        assert_eq!(lvm.pv_group("/dev/nbd0p1").await, None);
        assert!(lvm.logical_volumes("vg0").await.is_empty());
        assert_eq!(
            runner.calls()[0],
            "pvs --noheadings -o vg_name,vg_uuid --separator \t /dev/nbd0p1"
        );
    }
}
