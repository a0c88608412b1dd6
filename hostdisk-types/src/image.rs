// SPDX-License-Identifier: GPL-3.0-only

//! Disk image descriptions
//!
//! `ImageInfo` mirrors one element of `qemu-img info --output=json --backing-chain`.

use serde::{Deserialize, Serialize};

/// Path prefixes of images served over the network rather than from a local file
const NETWORK_PREFIXES: &[&str] = &[
    "rbd:",
    "nbd:",
    "iscsi:",
    "sheepdog:",
    "gluster:",
    "gluster+tcp:",
    "vitastor:",
];

/// A guest disk image to be introspected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskImage {
    pub path: String,
    pub encrypt: Option<EncryptInfo>,
}

impl DiskImage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            encrypt: None,
        }
    }

    pub fn with_encryption(mut self, encrypt: EncryptInfo) -> Self {
        self.encrypt = Some(encrypt);
        self
    }

    pub fn is_network(&self) -> bool {
        is_network_path(&self.path)
    }
}

/// Secret material for an encrypted image
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptInfo {
    /// Encryption format understood by qemu (`luks`)
    pub format: String,
    pub key: String,
}

impl std::fmt::Debug for EncryptInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptInfo")
            .field("format", &self.format)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    pub filename: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub virtual_size: u64,
    #[serde(default)]
    pub backing_filename: Option<String>,
    #[serde(default)]
    pub full_backing_filename: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

impl ImageInfo {
    pub fn is_raw(&self) -> bool {
        self.format == "raw"
    }
}

pub fn is_network_path(path: &str) -> bool {
    NETWORK_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Root-most ancestor of a backing chain (the last element `qemu-img` reports)
pub fn root_backing_path(chain: &[ImageInfo]) -> Option<&str> {
    chain.last().map(|info| info.filename.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backing_chain_json() {
        let json = r#"[
            {"filename": "/data/disks/vm1.qcow2", "format": "qcow2", "virtual-size": 10737418240,
             "backing-filename": "/data/images/tpl.qcow2", "full-backing-filename": "/data/images/tpl.qcow2"},
            {"filename": "/data/images/tpl.qcow2", "format": "qcow2", "virtual-size": 10737418240, "encrypted": false}
        ]"#;

        let chain: Vec<ImageInfo> = serde_json::from_str(json).expect("chain parses");
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain[0].full_backing_filename.as_deref(),
            Some("/data/images/tpl.qcow2")
        );
        assert_eq!(root_backing_path(&chain), Some("/data/images/tpl.qcow2"));
    }

    #[test]
    fn network_paths_are_recognized() {
        assert!(is_network_path("rbd:pool/image:conf=/etc/ceph/ceph.conf"));
        assert!(DiskImage::new("nbd:127.0.0.1:10809").is_network());
        assert!(!is_network_path("/var/lib/images/disk.qcow2"));
    }

    #[test]
    fn encryption_key_is_not_printed() {
        let info = EncryptInfo {
            format: "luks".to_string(),
            key: "s3cret".to_string(),
        };
        assert!(!format!("{info:?}").contains("s3cret"));
    }
}
