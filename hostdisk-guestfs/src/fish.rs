// SPDX-License-Identifier: GPL-3.0-only

//! One long-lived guestfish process driven over a pseudo-terminal

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::pty::{Winsize, openpty};
use nix::sys::termios::{LocalFlags, SetArg, Termios, tcgetattr, tcsetattr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use hostdisk_contracts::DiskError;
use hostdisk_types::{FilesystemType, GuestfsConfig, PartitionTableType};

use crate::framing::ResponseFramer;

const QUIT_GRACE: Duration = Duration::from_secs(5);
const WARNING_PREFIX: &str = "libguestfs: warning:";

/// Quote an argument for the guestfish command parser
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        return arg.to_string();
    }
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn command_line(name: &str, args: &[&str]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote_arg(arg));
    }
    line
}

/// `KEY: value` payload lines
fn parse_key_values(lines: &[String]) -> BTreeMap<String, String> {
    lines
        .iter()
        .filter_map(|line| line.split_once(": "))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

struct FishIo {
    child: Child,
    input: tokio::fs::File,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
}

pub struct Guestfish {
    id: u64,
    prompt: String,
    stderr_drain: Duration,
    io: AsyncMutex<Option<FishIo>>,
    alive: AtomicBool,
    label: Mutex<String>,
    /// Set while `mount-local-run` owns the command stream
    serving: watch::Sender<bool>,
}

/// Clears the serving flag when `mount-local-run` returns or is aborted
struct ServingView<'a>(&'a watch::Sender<bool>);

impl Drop for ServingView<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl std::fmt::Debug for Guestfish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guestfish")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("label", &self.label())
            .field("serving", &self.is_serving())
            .finish()
    }
}

impl Guestfish {
    /// Spawn guestfish and launch its appliance
    pub async fn start(config: &GuestfsConfig, id: u64) -> Result<Self, DiskError> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>).map_err(std::io::Error::from)?;
        let mut termios = tcgetattr(&pty.slave).map_err(std::io::Error::from)?;
        termios.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(std::io::Error::from)?;

        let mut child = Command::new(&config.binary)
            .args(&config.args)
            .stdin(Stdio::from(pty.slave))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                DiskError::unavailable(format!("failed to spawn {}: {error}", config.binary))
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(DiskError::internal("guestfish output pipes missing"));
        };
        let input = tokio::fs::File::from_std(std::fs::File::from(pty.master));

        let fish = Self {
            id,
            prompt: config.prompt.clone(),
            stderr_drain: config.stderr_drain(),
            io: AsyncMutex::new(Some(FishIo {
                child,
                input,
                stdout: BufReader::new(stdout).lines(),
                stderr: BufReader::new(stderr).lines(),
            })),
            alive: AtomicBool::new(true),
            label: Mutex::new(String::new()),
            serving: watch::Sender::new(false),
        };

        if let Err(error) = fish.execute("run").await {
            fish.terminate().await;
            return Err(error);
        }
        info!(fish = id, "guestfish started");
        Ok(fish)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Label of the attached drive; empty when none is attached
    pub fn label(&self) -> String {
        self.label
            .lock()
            .map(|label| label.clone())
            .unwrap_or_default()
    }

    fn set_label(&self, value: &str) {
        if let Ok(mut label) = self.label.lock() {
            *label = value.to_string();
        }
    }

    /// True while the worker serves a FUSE view and takes no other command
    pub fn is_serving(&self) -> bool {
        *self.serving.borrow()
    }

    fn serving_error(&self, command: &str) -> DiskError {
        DiskError::invalid_input(format!(
            "guestfish {} is serving a FUSE view, cannot run {command}",
            self.id
        ))
    }

    /// Send one command and wait for its framed response
    ///
    /// Fails fast instead of queueing while the worker serves a FUSE view,
    /// including when the view starts while this command waits for its turn.
    pub async fn execute(&self, command: &str) -> Result<Vec<String>, DiskError> {
        let mut serving = self.serving.subscribe();
        let view_started = async { serving.wait_for(|serving| *serving).await.map(|_| ()) };
        let guard = tokio::select! {
            biased;
            Ok(()) = view_started => return Err(self.serving_error(command)),
            guard = self.io.lock() => guard,
        };
        self.exchange(guard, command).await
    }

    async fn exchange(
        &self,
        mut guard: MutexGuard<'_, Option<FishIo>>,
        command: &str,
    ) -> Result<Vec<String>, DiskError> {
        let Some(io) = guard.as_mut() else {
            return Err(DiskError::worker_dead(format!("guestfish {} is terminated", self.id)));
        };
        if !self.is_alive() {
            return Err(DiskError::worker_dead(format!("guestfish {} is dead", self.id)));
        }

        debug!(fish = self.id, command = %command, "guestfish command");
        let write = async {
            io.input.write_all(format!("{command}\n\n").as_bytes()).await?;
            io.input.flush().await
        };
        if let Err(error) = write.await {
            self.mark_dead(io, &format!("write failed: {error}")).await;
            return Err(DiskError::worker_dead(format!("guestfish {}: {error}", self.id)));
        }

        let mut framer = ResponseFramer::new(&self.prompt);
        let payload = loop {
            match io.stdout.next_line().await {
                Ok(Some(line)) => {
                    if let Some(payload) = framer.push(&line) {
                        break payload;
                    }
                }
                Ok(None) => {
                    self.mark_dead(io, "stdout closed").await;
                    return Err(DiskError::worker_dead(format!(
                        "guestfish {} exited during {command}",
                        self.id
                    )));
                }
                Err(error) => {
                    self.mark_dead(io, &format!("read failed: {error}")).await;
                    return Err(DiskError::worker_dead(format!("guestfish {}: {error}", self.id)));
                }
            }
        };

        let errors = self.drain_stderr(io).await;
        if !errors.is_empty() {
            return Err(DiskError::command_failed(command, errors.join("\n")));
        }
        Ok(payload)
    }

    /// Anything on stderr within the drain window fails the command
    async fn drain_stderr(&self, io: &mut FishIo) -> Vec<String> {
        let deadline = Instant::now() + self.stderr_drain;
        let mut errors = Vec::new();
        while let Ok(Ok(Some(line))) = timeout_at(deadline, io.stderr.next_line()).await {
            if line.starts_with(WARNING_PREFIX) {
                warn!(fish = self.id, "{line}");
                continue;
            }
            if !line.trim().is_empty() {
                errors.push(line);
            }
        }
        errors
    }

    async fn mark_dead(&self, io: &mut FishIo, reason: &str) {
        warn!(fish = self.id, "guestfish is dead: {reason}");
        self.alive.store(false, Ordering::SeqCst);
        if let Err(error) = io.child.kill().await {
            warn!(fish = self.id, "killing guestfish failed: {error}");
        }
    }

    /// Quit and reap the process; never fails
    pub async fn terminate(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let Some(mut io) = self.io.lock().await.take() else {
            return;
        };

        if let Err(error) = io.input.write_all(b"quit\n").await {
            debug!(fish = self.id, "sending quit failed: {error}");
        }
        if let Err(error) = io.input.shutdown().await {
            warn!(fish = self.id, "closing guestfish input failed: {error}");
        }

        match timeout(QUIT_GRACE, io.child.wait()).await {
            Ok(Ok(status)) => debug!(fish = self.id, status = ?status, "guestfish exited"),
            Ok(Err(error)) => warn!(fish = self.id, "waiting for guestfish failed: {error}"),
            Err(_) => {
                warn!(fish = self.id, "guestfish did not quit, killing it");
                if let Err(error) = io.child.kill().await {
                    warn!(fish = self.id, "killing guestfish failed: {error}");
                }
            }
        }
        info!(fish = self.id, "guestfish terminated");
    }

    async fn call(&self, name: &str, args: &[&str]) -> Result<Vec<String>, DiskError> {
        self.execute(&command_line(name, args)).await
    }

    /// Hot-plug an image; the appliance must already be running
    pub async fn add_drive(&self, path: &str, label: &str, readonly: bool) -> Result<(), DiskError> {
        let label_opt = format!("label:{label}");
        let readonly_opt = format!("readonly:{readonly}");
        self.call("add-drive", &[path, &label_opt, &readonly_opt]).await?;
        self.set_label(label);
        Ok(())
    }

    /// Detach the current drive; no-op when none is attached
    pub async fn remove_drive(&self) -> Result<(), DiskError> {
        let label = self.label();
        if label.is_empty() {
            return Ok(());
        }
        self.call("remove-drive", &[&label]).await?;
        self.set_label("");
        Ok(())
    }

    pub async fn list_filesystems(&self) -> Result<BTreeMap<String, FilesystemType>, DiskError> {
        let lines = self.call("list-filesystems", &[]).await?;
        Ok(parse_key_values(&lines)
            .into_iter()
            .map(|(device, fs)| (device, FilesystemType::parse(&fs)))
            .collect())
    }

    pub async fn list_devices(&self) -> Result<Vec<String>, DiskError> {
        let lines = self.call("list-devices", &[]).await?;
        Ok(lines.into_iter().filter(|line| !line.is_empty()).collect())
    }

    pub async fn mount(&self, device: &str, mountpoint: &str, readonly: bool) -> Result<(), DiskError> {
        let name = if readonly { "mount-ro" } else { "mount" };
        self.call(name, &[device, mountpoint]).await.map(|_| ())
    }

    /// Prepare a FUSE view of the guest mounts on a host directory
    pub async fn mount_local(&self, dir: &str, readonly: bool) -> Result<(), DiskError> {
        if readonly {
            self.call("mount-local", &[dir, "readonly:true"]).await
        } else {
            self.call("mount-local", &[dir]).await
        }
        .map(|_| ())
    }

    /// Serve the FUSE view; returns only once the host directory is unmounted
    ///
    /// Every other command fails with `InvalidInput` until then.
    pub async fn mount_local_run(&self) -> Result<(), DiskError> {
        const COMMAND: &str = "mount-local-run";
        if self.serving.send_replace(true) {
            return Err(self.serving_error(COMMAND));
        }
        let _view = ServingView(&self.serving);
        let guard = self.io.lock().await;
        self.exchange(guard, COMMAND).await.map(|_| ())
    }

    pub async fn umount(&self, mountpoint: &str) -> Result<(), DiskError> {
        self.call("umount", &[mountpoint]).await.map(|_| ())
    }

    pub async fn umount_all(&self) -> Result<(), DiskError> {
        self.call("umount-all", &[]).await.map(|_| ())
    }

    pub async fn umount_local(&self) -> Result<(), DiskError> {
        self.call("umount-local", &[]).await.map(|_| ())
    }

    /// Let LVM see every device of the appliance
    pub async fn lvm_clear_filter(&self) -> Result<(), DiskError> {
        self.call("lvm-clear-filter", &[]).await.map(|_| ())
    }

    pub async fn lvs(&self) -> Result<Vec<String>, DiskError> {
        let lines = self.call("lvs", &[]).await?;
        Ok(lines.into_iter().filter(|line| !line.is_empty()).collect())
    }

    /// Exit status of the filesystem checker
    pub async fn fsck(&self, fs_type: &FilesystemType, device: &str) -> Result<i32, DiskError> {
        let lines = self.call("fsck", &[fs_type.as_str(), device]).await?;
        lines
            .iter()
            .find_map(|line| line.trim().parse().ok())
            .ok_or_else(|| DiskError::protocol(format!("fsck {device}: no status in response")))
    }

    pub async fn zerofree(&self, device: &str) -> Result<(), DiskError> {
        self.call("zerofree", &[device]).await.map(|_| ())
    }

    pub async fn blkid(&self, device: &str) -> Result<BTreeMap<String, String>, DiskError> {
        let lines = self.call("blkid", &[device]).await?;
        Ok(parse_key_values(&lines))
    }

    pub async fn mkswap(&self, device: &str, label: Option<&str>) -> Result<(), DiskError> {
        match label {
            Some(label) => {
                let label_opt = format!("label:{label}");
                self.call("mkswap", &[device, &label_opt]).await
            }
            None => self.call("mkswap", &[device]).await,
        }
        .map(|_| ())
    }

    pub async fn mkfs(&self, fs_type: &FilesystemType, device: &str) -> Result<(), DiskError> {
        self.call("mkfs", &[fs_type.as_str(), device]).await.map(|_| ())
    }

    /// Create one partition spanning the whole device
    pub async fn part_disk(&self, device: &str, table: PartitionTableType) -> Result<(), DiskError> {
        self.call("part-disk", &[device, table.as_parted_str()])
            .await
            .map(|_| ())
    }

    pub async fn part_get_parttype(&self, device: &str) -> Result<PartitionTableType, DiskError> {
        let lines = self.call("part-get-parttype", &[device]).await?;
        let reported = lines.first().map(String::as_str).unwrap_or_default();
        PartitionTableType::parse(reported)
            .ok_or_else(|| DiskError::unsupported(format!("partition table {reported} on {device}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hostdisk_contracts::DiskErrorKind;

    /// Speaks the guestfish echo protocol; stdin is the pty
    pub(crate) const FAKE_GUESTFISH: &str = r#"
while IFS= read -r line; do
  printf '><fs> %s\n' "$line"
  case "$line" in
    list-filesystems)
      printf '/dev/sda1: ext4\n/dev/sda2: ntfs\n/dev/sdb: unknown\n' ;;
    list-devices)
      printf '/dev/sda\n/dev/sdb\n' ;;
    lvs) ;;
    "blkid /dev/sda1")
      printf 'TYPE: ext4\nUUID: 3e5c-11\n' ;;
    "fsck ext4 /dev/sda1")
      printf '0\n' ;;
    "part-get-parttype /dev/sda")
      printf 'msdos\n' ;;
    mount-local-run)
      # serve until the next command line; quit ends the process
      read -r _
      read -r next
      [ "$next" = quit ] && exit 0 ;;
    broken*)
      echo 'libguestfs: error: broken: no such command' >&2 ;;
    noisy*)
      echo 'libguestfs: warning: something odd' >&2 ;;
    die)
      exit 1 ;;
    quit)
      exit 0 ;;
  esac
done
"#;

    pub(crate) fn fake_config() -> GuestfsConfig {
        GuestfsConfig {
            binary: "sh".to_string(),
            args: vec!["-c".to_string(), FAKE_GUESTFISH.to_string()],
            stderr_drain_ms: 50,
            ..GuestfsConfig::default()
        }
    }

    #[test]
    fn arguments_with_spaces_are_quoted() {
        assert_eq!(
            command_line("add-drive", &["/data/my disk.qcow2", "label:d1"]),
            "add-drive \"/data/my disk.qcow2\" label:d1"
        );
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[tokio::test]
    async fn lists_filesystems_in_device_order() {
        let fish = Guestfish::start(&fake_config(), 1).await.unwrap();
        let filesystems = fish.list_filesystems().await.unwrap();

        let devices: Vec<_> = filesystems.keys().cloned().collect();
        assert_eq!(devices, vec!["/dev/sda1", "/dev/sda2", "/dev/sdb"]);
        assert_eq!(filesystems["/dev/sda2"], FilesystemType::Ntfs);
        assert_eq!(fish.list_devices().await.unwrap(), vec!["/dev/sda", "/dev/sdb"]);
        assert!(fish.lvs().await.unwrap().is_empty());
        fish.terminate().await;
    }

    #[tokio::test]
    async fn stderr_output_fails_only_that_command() {
        let fish = Guestfish::start(&fake_config(), 2).await.unwrap();

        let error = fish.execute("broken-command").await.unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::CommandFailed);
        assert!(error.message.contains("no such command"));

        assert!(fish.is_alive());
        assert!(fish.execute("noisy-command").await.is_ok());
        assert_eq!(fish.fsck(&FilesystemType::Ext4, "/dev/sda1").await.unwrap(), 0);
        fish.terminate().await;
    }

    #[tokio::test]
    async fn exited_worker_is_marked_dead() {
        let fish = Guestfish::start(&fake_config(), 3).await.unwrap();

        let error = fish.execute("die").await.unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::WorkerDead);
        assert!(!fish.is_alive());

        let error = fish.list_devices().await.unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::WorkerDead);
        fish.terminate().await;
    }

    #[tokio::test]
    async fn drive_round_trip_restores_a_clean_worker() {
        let fish = Guestfish::start(&fake_config(), 4).await.unwrap();
        assert_eq!(fish.label(), "");

        fish.add_drive("/data/vm.qcow2", "d4a1", true).await.unwrap();
        assert_eq!(fish.label(), "d4a1");

        fish.remove_drive().await.unwrap();
        assert_eq!(fish.label(), "");
        assert!(fish.is_alive());
        fish.terminate().await;
    }

    #[tokio::test]
    async fn key_value_and_table_queries() {
        let fish = Guestfish::start(&fake_config(), 5).await.unwrap();

        let blkid = fish.blkid("/dev/sda1").await.unwrap();
        assert_eq!(blkid.get("UUID").map(String::as_str), Some("3e5c-11"));
        assert_eq!(
            fish.part_get_parttype("/dev/sda").await.unwrap(),
            PartitionTableType::Mbr
        );
        fish.terminate().await;
    }

    #[tokio::test]
    async fn commands_fail_fast_while_a_view_is_served() {
        let fish = std::sync::Arc::new(Guestfish::start(&fake_config(), 7).await.unwrap());
        let server = fish.clone();
        let view = tokio::spawn(async move { server.mount_local_run().await });
        timeout(Duration::from_secs(2), async {
            while !fish.is_serving() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let error = timeout(Duration::from_secs(1), fish.part_get_parttype("/dev/sda"))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::InvalidInput);
        let error = timeout(Duration::from_secs(1), fish.fsck(&FilesystemType::Ext4, "/dev/sda2"))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::InvalidInput);
        assert_eq!(
            fish.mount_local_run().await.unwrap_err().kind,
            DiskErrorKind::InvalidInput
        );

        view.abort();
        assert!(view.await.unwrap_err().is_cancelled());
        assert!(!fish.is_serving());
        fish.terminate().await;
        assert!(!fish.is_alive());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let config = GuestfsConfig {
            binary: "hostdisk-no-such-guestfish".to_string(),
            ..GuestfsConfig::default()
        };
        let error = Guestfish::start(&config, 6).await.unwrap_err();
        assert_eq!(error.kind, DiskErrorKind::Unavailable);
    }
}
