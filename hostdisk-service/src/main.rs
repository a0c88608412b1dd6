// SPDX-License-Identifier: GPL-3.0-only

//! hostdisk - look inside guest disk images from the host
//!
//! Results are printed as JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use hostdisk_contracts::{DiskDriver, DiskPartition};
use hostdisk_service::{DriverKind, HostDiskServices, logging};
use hostdisk_sys::HostCommandRunner;
use hostdisk_types::{DiskImage, EncryptInfo, HostDiskConfig};

/// Host-side disk image introspection
#[derive(Parser)]
#[command(name = "hostdisk")]
#[command(about = "Expose guest disk images and their partitions on the host", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $HOSTDISK_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect an image and list its partitions
    Inspect {
        /// Image path or network image URI (rbd:, nbd:, ...)
        image: String,
        /// auto, nbd or guestfs
        #[arg(long, default_value_t = DriverKind::Auto)]
        driver: DriverKind,
        /// Mount every partition and keep them mounted until interrupted
        #[arg(long)]
        mount: bool,
        /// Mount read-only
        #[arg(long, requires = "mount")]
        read_only: bool,
        /// Zero free blocks of ext filesystems before listing
        #[arg(long, conflicts_with = "mount")]
        zerofree: bool,
        /// Encryption format of the image (luks)
        #[arg(long, requires = "key_file")]
        encrypt_format: Option<String>,
        /// File holding the encryption passphrase
        #[arg(long, requires = "encrypt_format")]
        key_file: Option<PathBuf>,
    },
    /// Show the nbd device table
    Devices,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    image: String,
    lvm: bool,
    partitions: Vec<PartitionOutput>,
}

#[derive(Debug, Serialize)]
struct PartitionOutput {
    device: String,
    fs_type: String,
    kind: String,
    mounted: bool,
    readonly: bool,
    mount_path: Option<PathBuf>,
    table_type: Option<String>,
}

impl PartitionOutput {
    fn new(part: &Arc<dyn DiskPartition>, table_type: Option<String>) -> Self {
        Self {
            device: part.part_dev().to_string(),
            fs_type: part.fs_type().to_string(),
            kind: format!("{:?}", part.kind()).to_lowercase(),
            mounted: part.is_mounted(),
            readonly: part.is_readonly(),
            mount_path: part.is_mounted().then(|| part.mount_path().to_path_buf()),
            table_type,
        }
    }
}

async fn table_type(part: &Arc<dyn DiskPartition>) -> Option<String> {
    match part.physical_partition_type().await {
        Ok(table) => Some(table.as_parted_str().to_string()),
        Err(e) => {
            tracing::debug!(device = %part.part_dev(), "partition table unknown: {e}");
            None
        }
    }
}

fn load_image(
    path: String,
    encrypt_format: Option<String>,
    key_file: Option<PathBuf>,
) -> Result<DiskImage> {
    let image = DiskImage::new(path);
    let (Some(format), Some(key_file)) = (encrypt_format, key_file) else {
        return Ok(image);
    };
    let key = std::fs::read_to_string(&key_file)
        .with_context(|| format!("reading key file {}", key_file.display()))?;
    Ok(image.with_encryption(EncryptInfo {
        format,
        key: key.trim_end_matches('\n').to_string(),
    }))
}

async fn inspect(
    services: &Arc<HostDiskServices>,
    image: DiskImage,
    kind: DriverKind,
    mount: bool,
    read_only: bool,
    zerofree: bool,
) -> Result<()> {
    let mut driver = services.driver_for(image.clone(), kind)?;
    driver.connect().await?;

    let outcome = run_inspection(driver.as_ref(), &image, mount, read_only, zerofree).await;
    if let Err(e) = driver.disconnect().await {
        tracing::error!(image = %image.path, "disconnect failed: {e}");
    }
    outcome
}

async fn run_inspection(
    driver: &dyn DiskDriver,
    image: &DiskImage,
    mount: bool,
    read_only: bool,
    zerofree: bool,
) -> Result<()> {
    if zerofree {
        driver.zerofree_partitions().await?;
    }

    // before mounting: a guestfish worker serving a mount answers no queries
    let mut tables = Vec::new();
    for part in driver.partitions() {
        tables.push(table_type(part).await);
    }

    if mount {
        for part in driver.partitions() {
            let result = if read_only {
                part.mount_read_only().await
            } else {
                part.mount().await
            };
            if let Err(e) = result {
                tracing::warn!(device = %part.part_dev(), "mount failed: {e}");
            }
        }
    }

    let partitions = driver
        .partitions()
        .iter()
        .zip(tables)
        .map(|(part, table_type)| PartitionOutput::new(part, table_type))
        .collect();
    let output = InspectOutput {
        image: image.path.clone(),
        lvm: driver.is_lvm(),
        partitions,
    };
    println!("{}", serde_json::to_string(&output)?);

    if mount {
        tracing::info!("partitions mounted, press Ctrl-C to release them");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HostDiskConfig::load(cli.config.as_deref())?;
    logging::init(&config.log);

    tracing::info!("hostdisk v{}", env!("CARGO_PKG_VERSION"));

    // Check if running as root
    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("hostdisk must run as root");
        anyhow::bail!("hostdisk needs root privileges for nbd, lvm and mount");
    }

    let services = Arc::new(HostDiskServices::build(
        config,
        Arc::new(HostCommandRunner::new()),
    ));

    match cli.command {
        Commands::Inspect {
            image,
            driver,
            mount,
            read_only,
            zerofree,
            encrypt_format,
            key_file,
        } => {
            let image = load_image(image, encrypt_format, key_file)?;
            let sweeper = services.start_background_tasks();
            let result = inspect(&services, image, driver, mount, read_only, zerofree).await;
            if let Some(sweeper) = sweeper {
                sweeper.abort();
            }
            services.shutdown().await;
            result?;
        }
        Commands::Devices => {
            let devices = services
                .nbd_devices()
                .map(|registry| registry.snapshot())
                .unwrap_or_default();
            println!("{}", serde_json::to_string(&devices)?);
        }
    }

    Ok(())
}
