// SPDX-License-Identifier: GPL-3.0-only

//! Fixtures shared by the unit tests of this crate

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hostdisk_contracts::testing::ScriptedRunner;
use hostdisk_contracts::{CommandOutput, CommandRunner};
use hostdisk_types::{GuestfsConfig, HostDiskConfig, LvmConfig, MountConfig, NbdConfig};

use crate::partition::PartitionEnv;

/// Speaks the guestfish echo protocol
///
/// `$1` is printed for `list-filesystems` and `$2` for `lvs`, both through
/// `printf %b` so `\n` separates lines. `$3` picks how `mount-local-run`
/// behaves, see [`FakeView`].
const FAKE_GUESTFISH: &str = r#"
while IFS= read -r line; do
  printf '><fs> %s\n' "$line"
  case "$line" in
    mount-local-run)
      case "$3" in
        until-umount)
          while [ ! -e "$dir.released" ]; do sleep 0.05; done
          rm -f "$dir.released" ;;
        stuck)
          read -r _
          read -r next
          [ "$next" = quit ] && exit 0 ;;
      esac ;;
    "mount-local "*)
      dir="${line#mount-local }"
      dir="${dir%% *}" ;;
    list-filesystems)
      printf '%b' "$1" ;;
    lvs)
      printf '%b' "$2" ;;
    list-devices)
      printf '/dev/sda\n' ;;
    fsck*)
      printf '0\n' ;;
    "part-get-parttype /dev/sda")
      printf 'gpt\n' ;;
    "blkid /dev/sda1")
      printf 'TYPE: ext4\nUUID: 0c1d-77\n' ;;
    quit)
      exit 0 ;;
  esac
done
"#;

/// How the fake worker serves a FUSE view
#[derive(Clone, Copy)]
pub(crate) enum FakeView {
    /// `mount-local-run` returns at once
    ExitsEarly,
    /// `mount-local-run` returns once the host unmounts, see [`releasing_runner`]
    UntilHostUmount,
    /// `mount-local-run` never returns on its own
    Stuck,
}

impl FakeView {
    fn as_arg(self) -> &'static str {
        match self {
            Self::ExitsEarly => "",
            Self::UntilHostUmount => "until-umount",
            Self::Stuck => "stuck",
        }
    }
}

pub(crate) fn fake_fish_config(filesystems: &str, lvs: &str) -> GuestfsConfig {
    fake_fish_config_with_view(filesystems, lvs, FakeView::ExitsEarly)
}

pub(crate) fn fake_fish_config_with_view(
    filesystems: &str,
    lvs: &str,
    view: FakeView,
) -> GuestfsConfig {
    GuestfsConfig {
        binary: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            FAKE_GUESTFISH.to_string(),
            "fakefish".to_string(),
            filesystems.to_string(),
            lvs.to_string(),
            view.as_arg().to_string(),
        ],
        stderr_drain_ms: 50,
        maximum: 2,
        ..GuestfsConfig::default()
    }
}

pub(crate) fn mount_config(root: &Path) -> MountConfig {
    MountConfig {
        root: root.to_path_buf(),
        retries: 2,
        retry_base_ms: 1,
        retry_jitter_ms: 0,
        ..MountConfig::default()
    }
}

/// Host runner whose `umount <dir>` ends a [`FakeView::UntilHostUmount`] view
pub(crate) fn releasing_runner() -> Arc<ScriptedRunner> {
    Arc::new(ScriptedRunner::new(|program, args| {
        if program == "umount"
            && let Some(dir) = args.last()
        {
            std::fs::write(format!("{dir}.released"), b"").unwrap();
        }
        CommandOutput::ok("")
    }))
}

pub(crate) fn partition_env(runner: Arc<dyn CommandRunner>, root: &Path) -> Arc<PartitionEnv> {
    Arc::new(PartitionEnv::new(runner, mount_config(root)))
}

/// Temporary `/dev`, `/sys/block` and mount root with `devices` nbd nodes
pub(crate) struct FakeHost {
    root: tempfile::TempDir,
}

impl FakeHost {
    pub(crate) fn new(devices: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["dev", "sys", "mnt"] {
            std::fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        for index in 0..devices {
            std::fs::write(root.path().join(format!("dev/nbd{index}")), b"").unwrap();
        }
        Self { root }
    }

    pub(crate) fn dev_dir(&self) -> PathBuf {
        self.root.path().join("dev")
    }

    pub(crate) fn dev(&self, name: &str) -> String {
        self.dev_dir().join(name).to_string_lossy().to_string()
    }

    pub(crate) fn config(&self) -> HostDiskConfig {
        HostDiskConfig {
            nbd: NbdConfig {
                dev_dir: self.dev_dir(),
                sys_block_dir: self.root.path().join("sys"),
                partition_probe_tries: 2,
                partition_probe_base_ms: 10,
                ..NbdConfig::default()
            },
            mount: mount_config(&self.root.path().join("mnt")),
            lvm: LvmConfig {
                lv_retry_delay_ms: 10,
            },
            ..HostDiskConfig::default()
        }
    }
}
