//! bucketfs - Encrypted bucket-backed drive
//!
//! Usage:
//!   bucketfs init      - Write a default configuration
//!   bucketfs mount     - Mount the drive and run the synchronizer
//!   bucketfs unmount   - Unmount the drive
//!   bucketfs status    - Show mount and sync queue status
//!   bucketfs sync      - Run one synchronizer pass

use bucketfs::{
    bucket::{BucketRegistry, DirBucketClient, Keychain, LocalHub, StaticKeychain},
    config::{expand_tilde, Config},
    fs::{EntryModes, NoSharedFiles, SpaceFs},
    fuse::{should_mount, MountController},
    metadata::MetadataStore,
    space::SpaceService,
    sync::{BucketTaskExecutor, QueueSnapshot, Synchronizer},
    Error, Result,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// State key holding this device's identity
const IDENTITY_KEY: &str = "identityPublicKey";

#[derive(Parser)]
#[command(name = "bucketfs")]
#[command(author = "bucketfs Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted bucket-backed drive")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/bucketfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mount the drive and keep the mirror in sync until interrupted
    Mount {
        /// Mount point (defaults to the configured one)
        mount_point: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the drive
    Unmount {
        /// Mount point (defaults to the configured one)
        mount_point: Option<PathBuf>,
    },

    /// Show mount and sync queue status
    Status,

    /// Restore the persisted sync queue and run one pass
    Sync,
}

fn main() {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = Config::load(&config_path)
                .map(|config| config.logging.level)
                .unwrap_or_else(|_| "info".to_string());
            EnvFilter::new(level)
        })
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init { force } => cmd_init(config_path, force),
        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(config_path, mount_point, allow_other),
        Commands::Unmount { mount_point } => cmd_unmount(config_path, mount_point),
        Commands::Status => cmd_status(config_path),
        Commands::Sync => cmd_sync(config_path),
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn new_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))
}

/// Everything a running drive needs, wired over a directory-backed remote
struct Daemon {
    config: Config,
    metadata: MetadataStore,
    sync: Arc<Synchronizer>,
    service: Arc<SpaceService>,
}

impl Daemon {
    async fn open(config: Config) -> Result<Self> {
        config.ensure_directories()?;
        let metadata = MetadataStore::open(config.metadata_path())?;

        let remote = Arc::new(DirBucketClient::open(config.data_dir.join("remote"))?);
        let hub = Arc::new(LocalHub::new(Arc::new(DirBucketClient::open(
            config.data_dir.join("hub"),
        )?)));
        let registry = Arc::new(BucketRegistry::new(
            remote,
            hub,
            metadata.clone(),
            config.listing.policy,
        ));

        let keychain: Arc<dyn Keychain> = Arc::new(StaticKeychain::new(identity(&metadata)?));
        let executor = Arc::new(BucketTaskExecutor::new(
            registry.clone(),
            keychain,
            config.scratch_dir(),
        ));
        let sync = Arc::new(Synchronizer::new(
            metadata.clone(),
            config.sync.clone(),
            executor,
        ));
        let service = Arc::new(SpaceService::new(
            registry,
            sync.notifier(),
            config.scratch_dir(),
            EntryModes::from(&config.mount),
        ));

        let slug = config.buckets.default_bucket.clone();
        if metadata.find_bucket(&slug)?.is_none() {
            service.create_bucket(&slug).await?;
            info!("Created bucket {}", slug);
        }

        Ok(Daemon {
            config,
            metadata,
            sync,
            service,
        })
    }

    fn space_fs(&self) -> Arc<SpaceFs> {
        Arc::new(SpaceFs::with_space(
            self.service.clone(),
            &self.config.buckets.default_bucket,
            Arc::new(NoSharedFiles),
            &self.config.scratch_dir(),
        ))
    }
}

/// This device's identity, generated on first use
fn identity(metadata: &MetadataStore) -> Result<String> {
    if let Some(key) = metadata.get_state(IDENTITY_KEY)? {
        return Ok(String::from_utf8_lossy(&key).into_owned());
    }
    let key = Uuid::new_v4().simple().to_string();
    metadata.save_state(IDENTITY_KEY, key.as_bytes())?;
    Ok(key)
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    info!("Initializing bucketfs...");

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        )));
    }

    let config = Config::default();
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    info!("");
    info!("Next steps:");
    info!("  Run 'bucketfs mount' to mount the drive");

    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    allow_other: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = mount_point;
    }
    config.mount.allow_other |= allow_other;

    let runtime = new_runtime()?;
    runtime.block_on(async {
        let daemon = Daemon::open(config).await?;
        daemon.sync.restore_queue().await?;
        daemon.sync.start();

        let controller = MountController::new(
            daemon.config.mount.clone(),
            daemon.metadata.clone(),
            daemon.space_fs(),
            tokio::runtime::Handle::current(),
        );
        let path = match controller.restore()? {
            Some(path) => {
                info!("Remounted drive left mounted at last shutdown");
                path
            }
            None => controller.mount()?,
        };

        info!(
            "Serving {:?} until Ctrl-C or 'bucketfs unmount {}'",
            path,
            path.display()
        );

        let mut watch = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    controller.shutdown();
                    break;
                }
                _ = watch.tick() => {
                    if !controller.is_serving() {
                        info!("{:?} was unmounted", path);
                        controller.unmount()?;
                        break;
                    }
                }
            }
        }

        daemon.sync.shutdown().await;
        Ok(())
    })
}

fn cmd_unmount(config_path: &Path, mount_point: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let mount_point = expand_tilde(&mount_point.unwrap_or(config.mount.mount_point.clone()));
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(&mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(&mount_point)
        .output()?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    // A running drive clears its own flag; a stale one is cleared here
    match MetadataStore::open(config.metadata_path()) {
        Ok(metadata) => bucketfs::fuse::set_mount_flag(&metadata, false)?,
        Err(e) => warn!("Store is held by the running drive: {}", e),
    }

    info!("Unmounted successfully");
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let metadata = MetadataStore::open(config.metadata_path())?;

    println!("bucketfs Status");
    println!("===============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!(
        "Mounted at last shutdown: {}",
        if should_mount(&metadata)? { "yes" } else { "no" }
    );
    println!(
        "Sync: {} (every {}s, {} parallel tasks)",
        if config.sync.enabled { "enabled" } else { "disabled" },
        config.sync.interval_secs,
        config.sync.max_parallel_tasks
    );

    let buckets = metadata.list_buckets()?;
    println!("Buckets: {}", buckets.len());
    for bucket in &buckets {
        println!(
            "  {} (backup {})",
            bucket.slug,
            if bucket.backup { "on" } else { "off" }
        );
    }

    match QueueSnapshot::load(&metadata)? {
        Some(snapshot) => println!("{}", snapshot),
        None => println!("Sync queues: empty"),
    }

    Ok(())
}

fn cmd_sync(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    let runtime = new_runtime()?;
    runtime.block_on(async {
        let daemon = Daemon::open(config).await?;
        daemon.sync.restore_queue().await?;

        info!("Running sync pass...");
        daemon.sync.sync_now().await;

        println!("{}", daemon.sync);
        daemon.sync.shutdown().await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_has_no_background_mode() {
        let cli = Cli::try_parse_from(["bucketfs", "mount", "/tmp/drive", "--allow-other"]).unwrap();
        match cli.command {
            Commands::Mount {
                mount_point,
                allow_other,
            } => {
                assert_eq!(mount_point, Some(PathBuf::from("/tmp/drive")));
                assert!(allow_other);
            }
            _ => panic!("expected mount"),
        }

        assert!(Cli::try_parse_from(["bucketfs", "mount", "--foreground"]).is_err());
    }
}
