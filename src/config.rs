//! Configuration management for bucketfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default seconds between synchronizer passes
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Default number of pinning tasks run at once
pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 16;

/// Retry forever
pub const UNLIMITED_RETRIES: i32 = -1;

/// Bucket used by the "Files" drive folder
pub const DEFAULT_BUCKET: &str = "personal";

/// What a listing does with an entry whose name cannot be decrypted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListingPolicy {
    /// Log the entry and leave it out of the listing
    #[default]
    SkipUndecryptable,
    /// Fail the whole listing
    FailListing,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Synchronizer configuration
    pub sync: SyncConfig,

    /// Listing configuration
    #[serde(default)]
    pub listing: ListingConfig,

    /// Bucket configuration
    #[serde(default)]
    pub buckets: BucketsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory (metadata store, scratch files, local remote)
    pub data_dir: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Preferred mount point; `~` is expanded
    pub mount_point: PathBuf,

    /// Volume name shown by the OS
    pub drive_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Remount on start if the drive was mounted at last shutdown
    pub auto_mount: bool,

    /// Default file permissions
    pub file_mode: u32,

    /// Default directory permissions
    pub dir_mode: u32,

    /// Permissions of read-only top level directories
    pub restricted_dir_mode: u32,

    /// UID for files
    pub uid: u32,

    /// GID for files
    pub gid: u32,
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run the background synchronizer
    pub enabled: bool,

    /// Seconds between passes when no work is signalled
    pub interval_secs: u64,

    /// Maximum concurrently running pinning tasks
    pub max_parallel_tasks: usize,

    /// Retry limit for new tasks (-1 = unlimited)
    pub default_max_retries: i32,
}

/// Listing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingConfig {
    pub policy: ListingPolicy,
}

/// Bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketsConfig {
    /// Bucket backing the "Files" folder
    pub default_bucket: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bucketfs");

        Config {
            mount: MountConfig::default(),
            sync: SyncConfig::default(),
            listing: ListingConfig::default(),
            buckets: BucketsConfig::default(),
            logging: LoggingConfig::default(),
            data_dir,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("~/Space"),
            drive_name: "Space".to_string(),
            allow_other: false,
            auto_mount: true,
            file_mode: 0o600,
            dir_mode: 0o700,
            restricted_dir_mode: 0o500,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enabled: true,
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
            default_max_retries: UNLIMITED_RETRIES,
        }
    }
}

impl Default for BucketsConfig {
    fn default() -> Self {
        BucketsConfig {
            default_bucket: DEFAULT_BUCKET.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mount_point) = std::env::var("BUCKETFS_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Ok(interval) = std::env::var("BUCKETFS_SYNC_INTERVAL") {
            if let Ok(secs) = interval.trim().parse::<u64>() {
                self.sync.interval_secs = secs;
            }
        }

        if let Ok(data_dir) = std::env::var("BUCKETFS_DATA_DIR") {
            let data_dir = data_dir.trim();
            if !data_dir.is_empty() {
                self.data_dir = PathBuf::from(data_dir);
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        };

        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "Sync interval must be greater than 0".to_string(),
            ));
        }

        if self.sync.max_parallel_tasks == 0 {
            return Err(Error::InvalidConfig(
                "max_parallel_tasks must be greater than 0".to_string(),
            ));
        }

        if self.sync.default_max_retries < UNLIMITED_RETRIES {
            return Err(Error::InvalidConfig(format!(
                "default_max_retries must be -1 (unlimited) or a retry count, got {}",
                self.sync.default_max_retries
            )));
        }

        if self.buckets.default_bucket.is_empty() {
            return Err(Error::InvalidConfig(
                "default_bucket must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory for copy-on-open scratch files
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    /// Location of the sled metadata store
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.scratch_dir())?;
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.sync.max_parallel_tasks, 16);
        assert_eq!(config.sync.default_max_retries, -1);
        assert_eq!(config.listing.policy, ListingPolicy::SkipUndecryptable);
        assert_eq!(config.mount.file_mode, 0o600);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.sync.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.default_max_retries = -2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.max_parallel_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.listing.policy = ListingPolicy::FailListing;
        config.sync.interval_secs = 5;

        for name in ["config.json", "config.yaml"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            let loaded = Config::load(&path).unwrap();
            assert_eq!(loaded.listing.policy, ListingPolicy::FailListing);
            assert_eq!(loaded.mount.drive_name, "Space");
        }
    }

    #[test]
    fn test_policy_serialization() {
        let json = serde_json::to_string(&ListingPolicy::FailListing).unwrap();
        assert_eq!(json, "\"fail_listing\"");
    }

    #[test]
    fn test_expand_tilde() {
        let plain = PathBuf::from("/mnt/space");
        assert_eq!(expand_tilde(&plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/Space")), home.join("Space"));
        }
    }
}
