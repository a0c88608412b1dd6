// SPDX-License-Identifier: GPL-3.0-only

//! `qemu-nbd` front-end

use std::fmt;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use hostdisk_contracts::{CommandRunner, DiskError};
use hostdisk_types::DiskImage;

use crate::qemu_img::ImageProbe;

/// `major.minor.patch` of a qemu tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion(pub u32, pub u32, pub u32);

impl ToolVersion {
    /// Parse `6.2.0` or the first version-looking word of `--version` output
    pub fn parse(text: &str) -> Option<Self> {
        let first_line = text.lines().next()?;
        first_line.split_whitespace().find_map(|word| {
            let mut parts = word.split('.').map(|part| part.parse::<u32>());
            let major = parts.next()?.ok()?;
            let minor = parts.next()?.ok()?;
            let patch = match parts.next() {
                Some(part) => part.ok()?,
                None => 0,
            };
            Some(Self(major, minor, patch))
        })
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

const SECRET_ID: &str = "sec0";

/// Argument vector for exposing `image` through `device`
pub fn connect_args(device: &str, image: &DiskImage, probe: &ImageProbe, fork: bool) -> Vec<String> {
    let mut args = vec!["-c".to_string(), device.to_string()];
    match &image.encrypt {
        Some(encrypt) => {
            let driver = if probe.force_raw() {
                "raw"
            } else {
                probe.format().unwrap_or("qcow2")
            };
            args.push("--object".to_string());
            args.push(format!("secret,id={SECRET_ID},data={}", encrypt.key));
            args.push("--image-opts".to_string());
            args.push(format!(
                "driver={driver},file.filename={},encrypt.format={},encrypt.key-secret={SECRET_ID}",
                image.path, encrypt.format
            ));
        }
        None => {
            if probe.force_raw() {
                args.push("-f".to_string());
                args.push("raw".to_string());
            }
            args.push(image.path.clone());
        }
    }

    if fork {
        args.push("--fork".to_string());
    }
    args
}

pub struct QemuNbd {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    fork_min: Option<ToolVersion>,
    version: OnceCell<Option<ToolVersion>>,
}

impl QemuNbd {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, min_fork: &str) -> Self {
        let fork_min = ToolVersion::parse(min_fork);
        if fork_min.is_none() {
            warn!(version = %min_fork, "unparsable qemu-nbd fork version, --fork disabled");
        }
        Self {
            runner,
            binary: binary.into(),
            fork_min,
            version: OnceCell::new(),
        }
    }

    /// Installed version, queried once per process
    pub async fn version(&self) -> Option<ToolVersion> {
        *self
            .version
            .get_or_init(|| async {
                let output = match self.runner.run(&self.binary, &["--version"]).await {
                    Ok(output) if output.success() => output.stdout,
                    Ok(output) => {
                        warn!("{} --version failed: {}", self.binary, output.stderr.trim());
                        return None;
                    }
                    Err(error) => {
                        warn!("{} --version failed: {error}", self.binary);
                        return None;
                    }
                };
                let version = ToolVersion::parse(&output);
                debug!(version = ?version, "qemu-nbd version");
                version
            })
            .await
    }

    async fn supports_fork(&self) -> bool {
        match (self.version().await, self.fork_min) {
            (Some(version), Some(min)) => version >= min,
            _ => false,
        }
    }

    pub async fn connect(
        &self,
        device: &str,
        image: &DiskImage,
        probe: &ImageProbe,
    ) -> Result<(), DiskError> {
        let args = connect_args(device, image, probe, self.supports_fork().await);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        info!(device = %device, image = %image.path, "exposing image through nbd");
        let output = self.runner.run(&self.binary, &args).await?;
        if !output.success() {
            // the rendered command may carry an encryption secret
            return Err(DiskError::command_failed(
                &format!("{} -c {device} {}", self.binary, image.path),
                output.stderr,
            ));
        }
        Ok(())
    }

    pub async fn disconnect(&self, device: &str) -> Result<(), DiskError> {
        self.runner.run_checked(&self.binary, &["-d", device]).await?;
        info!(device = %device, "nbd device disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdisk_contracts::CommandOutput;
    use hostdisk_contracts::testing::ScriptedRunner;
    use hostdisk_types::{EncryptInfo, ImageInfo};

    fn qcow2_probe(path: &str) -> ImageProbe {
        ImageProbe::from_chain(
            path,
            vec![ImageInfo {
                filename: path.to_string(),
                format: "qcow2".to_string(),
                ..ImageInfo::default()
            }],
        )
    }

    #[test]
    fn parses_version_banner() {
        let banner = "qemu-nbd 6.2.0 (Debian 1:6.2+dfsg-2ubuntu6)\nWritten by Anthony Liguori.\n";
        assert_eq!(ToolVersion::parse(banner), Some(ToolVersion(6, 2, 0)));
        assert_eq!(ToolVersion::parse("4.0"), Some(ToolVersion(4, 0, 0)));
        assert!(ToolVersion(2, 12, 0) < ToolVersion(4, 0, 0));
        assert_eq!(ToolVersion::parse("qemu-nbd"), None);
    }

    #[test]
    fn plain_qcow2_image() {
        let image = DiskImage::new("/data/vm.qcow2");
        let args = connect_args("/dev/nbd0", &image, &qcow2_probe("/data/vm.qcow2"), false);
        assert_eq!(args, vec!["-c", "/dev/nbd0", "/data/vm.qcow2"]);
    }

    #[test]
    fn network_image_is_forced_raw() {
        let image = DiskImage::new("rbd:pool/disk");
        let args = connect_args("/dev/nbd1", &image, &ImageProbe::network(&image.path), true);
        assert_eq!(
            args,
            vec!["-c", "/dev/nbd1", "-f", "raw", "rbd:pool/disk", "--fork"]
        );
    }

    #[test]
    fn encrypted_image_uses_image_opts() {
        let image = DiskImage::new("/data/enc.qcow2").with_encryption(EncryptInfo {
            format: "luks".to_string(),
            key: "k3y".to_string(),
        });
        let args = connect_args("/dev/nbd0", &image, &qcow2_probe("/data/enc.qcow2"), false);

        assert_eq!(args[2], "--object");
        assert_eq!(args[3], "secret,id=sec0,data=k3y");
        assert_eq!(args[4], "--image-opts");
        assert_eq!(
            args[5],
            "driver=qcow2,file.filename=/data/enc.qcow2,encrypt.format=luks,encrypt.key-secret=sec0"
        );
    }

    #[tokio::test]
    async fn fork_follows_installed_version() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args == ["--version"] {
                CommandOutput::ok("qemu-nbd 2.12.0\n")
            } else {
                CommandOutput::ok("")
            }
        }));
        let nbd = QemuNbd::new(runner.clone(), "qemu-nbd", "4.0.0");
        let image = DiskImage::new("/data/vm.qcow2");

        nbd.connect("/dev/nbd0", &image, &qcow2_probe(&image.path)).await.unwrap();
        nbd.connect("/dev/nbd1", &image, &qcow2_probe(&image.path)).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.iter().filter(|call| call.ends_with("--version")).count(), 1);
        assert!(calls.iter().all(|call| !call.contains("--fork")));
    }

    #[tokio::test]
    async fn failed_connect_does_not_leak_the_secret() {
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args == ["--version"] {
                CommandOutput::ok("qemu-nbd 6.2.0\n")
            } else {
                CommandOutput::failed(1, "Failed to blk_new_open")
            }
        }));
        let nbd = QemuNbd::new(runner, "qemu-nbd", "4.0.0");
        let image = DiskImage::new("/data/enc.qcow2").with_encryption(EncryptInfo {
            format: "luks".to_string(),
            key: "k3y".to_string(),
        });

        let error = nbd
            .connect("/dev/nbd0", &image, &qcow2_probe(&image.path))
            .await
            .unwrap_err();
        assert!(!error.message.contains("k3y"));
    }
}
