// SPDX-License-Identifier: GPL-3.0-only

//! Host mount, repair and zero-fill tools

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use hostdisk_contracts::{CommandRunner, DiskError, render_command};
use hostdisk_types::FilesystemType;

/// A host command line plus the exit codes that count as success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: &'static str,
    pub args: Vec<String>,
    pub ok_codes: &'static [i32],
}

impl ToolCommand {
    fn new(program: &'static str, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            ok_codes: &[0],
        }
    }

    fn accepting(mut self, ok_codes: &'static [i32]) -> Self {
        self.ok_codes = ok_codes;
        self
    }

    pub fn rendered(&self) -> String {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        render_command(self.program, &args)
    }
}

pub fn mount_command(device: &str, dir: &Path, fs_type: &FilesystemType, readonly: bool) -> ToolCommand {
    let mut args = Vec::new();
    if matches!(fs_type, FilesystemType::Ntfs) {
        args.push("-t".to_string());
        args.push("ntfs-3g".to_string());
    }
    if readonly {
        args.push("-o".to_string());
        args.push("ro".to_string());
    }
    args.push(device.to_string());
    args.push(dir.to_string_lossy().to_string());
    ToolCommand::new("mount", args)
}

pub fn umount_command(dir: &Path) -> ToolCommand {
    ToolCommand::new("umount", vec![dir.to_string_lossy().to_string()])
}

/// Non-interactive repair for filesystems that have a repair tool
pub fn fsck_command(device: &str, fs_type: &FilesystemType) -> Option<ToolCommand> {
    let device = device.to_string();
    match fs_type {
        // exit 1 means errors were corrected
        fs if fs.is_ext() => Some(
            ToolCommand::new("e2fsck", vec!["-f".to_string(), "-p".to_string(), device])
                .accepting(&[0, 1]),
        ),
        FilesystemType::Xfs => Some(ToolCommand::new("xfs_repair", vec![device])),
        FilesystemType::Ntfs => Some(ToolCommand::new("ntfsfix", vec![device])),
        _ => None,
    }
}

pub fn zerofree_command(device: &str, fs_type: &FilesystemType) -> Option<ToolCommand> {
    fs_type
        .is_ext()
        .then(|| ToolCommand::new("zerofree", vec![device.to_string()]))
}

pub struct MountTools {
    runner: Arc<dyn CommandRunner>,
}

impl MountTools {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn execute(&self, command: &ToolCommand) -> Result<(), DiskError> {
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let output = self.runner.run(command.program, &args).await?;
        match output.status {
            Some(code) if command.ok_codes.contains(&code) => Ok(()),
            _ => Err(DiskError::command_failed(
                &command.rendered(),
                if output.stderr.trim().is_empty() {
                    format!("exit status {:?}", output.status)
                } else {
                    output.stderr
                },
            )),
        }
    }

    pub async fn mount(
        &self,
        device: &str,
        dir: &Path,
        fs_type: &FilesystemType,
        readonly: bool,
    ) -> Result<(), DiskError> {
        tokio::fs::create_dir_all(dir).await?;
        self.execute(&mount_command(device, dir, fs_type, readonly)).await?;
        info!(device = %device, dir = %dir.display(), readonly, "mounted");
        Ok(())
    }

    pub async fn umount(&self, dir: &Path) -> Result<(), DiskError> {
        self.execute(&umount_command(dir)).await?;
        debug!(dir = %dir.display(), "unmounted");
        Ok(())
    }

    pub async fn fsck(&self, device: &str, fs_type: &FilesystemType) -> Result<(), DiskError> {
        let command = fsck_command(device, fs_type)
            .ok_or_else(|| DiskError::unsupported(format!("no repair tool for {fs_type}")))?;
        self.execute(&command).await
    }

    pub async fn zerofree(&self, device: &str, fs_type: &FilesystemType) -> Result<(), DiskError> {
        let command = zerofree_command(device, fs_type)
            .ok_or_else(|| DiskError::unsupported(format!("zerofree does not support {fs_type}")))?;
        self.execute(&command).await
    }
}
