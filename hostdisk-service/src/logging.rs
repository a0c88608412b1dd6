// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hostdisk_types::LogConfig;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_PREFIX: &str = "hostdisk.log";
const LOG_DIR_ENV: &str = "HOSTDISK_LOG_DIR";
const CRATES: &[&str] = &[
    "hostdisk",
    "hostdisk_service",
    "hostdisk_sys",
    "hostdisk_guestfs",
    "hostdisk_contracts",
];

/// Our crates at `level`, everything else at warn
fn default_directives(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATES.iter().map(|name| format!("{name}={level}")));
    directives.join(",")
}

/// Log to stderr, and to a daily rolling file when a directory is configured
///
/// `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let dir = std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| config.dir.clone());
    let Some(dir) = dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return;
    };

    match file_writer(&dir, config.keep_days) {
        Ok((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            // flushes on exit only while the guard lives
            let _ = LOG_GUARD.set(guard);
        }
        Err(e) => {
            eprintln!("hostdisk: failed to initialize file logging: {e:#}");
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
        }
    }
}

fn file_writer(
    dir: &Path,
    keep_days: u64,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if let Err(e) = fs::create_dir_all(dir) {
        return Err(anyhow::anyhow!(
            "create log directory failed: {} ({})",
            dir.display(),
            e
        ));
    }

    let prefix = OsString::from(LOG_PREFIX);
    cleanup_old_logs(dir, &prefix, keep_days);

    let appender = tracing_appender::rolling::daily(dir, &prefix);
    Ok(tracing_appender::non_blocking(appender))
}

fn cleanup_old_logs(dir: &Path, prefix: &OsString, keep_days: u64) {
    let cutoff = SystemTime::now().checked_sub(Duration::from_secs(keep_days * 24 * 60 * 60));
    let Some(cutoff) = cutoff else { return };

    let prefix = prefix.to_string_lossy();

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        // rolled files are `<prefix>.<date>`
        if !entry.file_name().to_string_lossy().starts_with(prefix.as_ref()) {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|metadata| metadata.modified()) else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        let _ = fs::remove_file(entry.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_every_crate() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("hostdisk_guestfs=debug"));
        assert!(directives.contains("hostdisk_sys=debug"));
    }

    #[test]
    fn only_expired_rolled_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("hostdisk.log.2020-01-01");
        let fresh = dir.path().join("hostdisk.log.2099-01-01");
        let foreign = dir.path().join("other.log");
        for path in [&old, &fresh, &foreign] {
            fs::write(path, b"line\n").unwrap();
        }
        let long_ago = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        for path in [&old, &foreign] {
            fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(long_ago)
                .unwrap();
        }

        cleanup_old_logs(dir.path(), &OsString::from(LOG_PREFIX), 7);

        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }
}
