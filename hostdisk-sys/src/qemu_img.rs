// SPDX-License-Identifier: GPL-3.0-only

//! Image metadata through `qemu-img info`

use std::sync::Arc;

use tracing::debug;

use hostdisk_contracts::{CommandRunner, DiskError};
use hostdisk_types::{DiskImage, ImageInfo, root_backing_path};

/// What is known about an image before it is exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProbe {
    backing_path: String,
    chain: Vec<ImageInfo>,
    network: bool,
}

impl ImageProbe {
    /// Network images are not probed; the path itself is the identity
    pub fn network(path: &str) -> Self {
        Self {
            backing_path: path.to_string(),
            chain: Vec::new(),
            network: true,
        }
    }

    pub fn from_chain(path: &str, chain: Vec<ImageInfo>) -> Self {
        let backing_path = root_backing_path(&chain).unwrap_or(path).to_string();
        Self {
            backing_path,
            chain,
            network: false,
        }
    }

    /// Root-most ancestor of the backing chain
    pub fn backing_path(&self) -> &str {
        &self.backing_path
    }

    pub fn chain(&self) -> &[ImageInfo] {
        &self.chain
    }

    /// Format of the top image, if reported
    pub fn format(&self) -> Option<&str> {
        self.chain
            .first()
            .map(|info| info.format.as_str())
            .filter(|format| !format.is_empty())
    }

    pub fn force_raw(&self) -> bool {
        self.network || self.chain.first().is_some_and(ImageInfo::is_raw)
    }

    pub fn is_encrypted(&self) -> bool {
        self.chain.first().is_some_and(|info| info.encrypted)
    }
}

pub struct QemuImg {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl QemuImg {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    pub async fn probe(&self, image: &DiskImage) -> Result<ImageProbe, DiskError> {
        if image.is_network() {
            return Ok(ImageProbe::network(&image.path));
        }

        let stdout = self
            .runner
            .run_checked(
                &self.binary,
                &["info", "--output=json", "--backing-chain", "-U", &image.path],
            )
            .await?;
        let chain = parse_backing_chain(&stdout)?;
        let probe = ImageProbe::from_chain(&image.path, chain);
        debug!(
            image = %image.path,
            backing = %probe.backing_path(),
            depth = probe.chain().len(),
            "image probed"
        );
        Ok(probe)
    }
}

fn parse_backing_chain(stdout: &str) -> Result<Vec<ImageInfo>, DiskError> {
    let chain: Vec<ImageInfo> = serde_json::from_str(stdout)
        .map_err(|error| DiskError::protocol(format!("unparsable qemu-img info output: {error}")))?;
    if chain.is_empty() {
        return Err(DiskError::protocol("qemu-img info reported an empty chain"));
    }
    Ok(chain)
}
