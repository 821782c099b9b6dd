//! Mount lifecycle
//!
//! Picks a free mount point, runs the FUSE session in the background and
//! remembers across restarts whether the drive should be mounted.

use crate::config::{expand_tilde, MountConfig};
use crate::error::{Error, Result};
use crate::fs::SpaceFs;
use crate::fuse::filesystem::DriveFs;
use crate::metadata::{MetadataStore, MOUNT_FLAG_KEY};
use fuser::{BackgroundSession, MountOption};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Number of numbered alternatives tried when the mount point is taken
const MOUNT_PATH_SUFFIXES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted { path: PathBuf },
}

/// `path` itself if it does not exist yet, else the first free `<path>N`
pub fn resolve_mount_path(path: &Path) -> Result<PathBuf> {
    let base = path.to_string_lossy().trim_end_matches('/').to_string();
    let base = PathBuf::from(if base.is_empty() { "/".to_string() } else { base });
    if !base.exists() {
        return Ok(base);
    }

    for i in 0..MOUNT_PATH_SUFFIXES {
        let candidate = PathBuf::from(format!("{}{}", base.display(), i));
        if !candidate.exists() {
            debug!("{} exists, using {}", base.display(), candidate.display());
            return Ok(candidate);
        }
    }
    Err(Error::MountPathUnavailable(base.display().to_string()))
}

/// True only if the drive was left mounted
pub fn should_mount(metadata: &MetadataStore) -> Result<bool> {
    Ok(metadata
        .get_state(MOUNT_FLAG_KEY)?
        .is_some_and(|flag| flag == b"true"))
}

pub fn set_mount_flag(metadata: &MetadataStore, mounted: bool) -> Result<()> {
    let flag: &[u8] = if mounted { b"true" } else { b"false" };
    metadata.save_state(MOUNT_FLAG_KEY, flag)
}

fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.drive_name.clone()),
        MountOption::Subtype("bucketfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

struct ActiveMount {
    session: BackgroundSession,
    path: PathBuf,
}

impl ActiveMount {
    /// Wait for the session to end and drop the mount directory again so
    /// the next mount gets the same path
    fn end(self) -> PathBuf {
        self.session.join();
        if let Err(e) = std::fs::remove_dir(&self.path) {
            debug!("Keeping {}: {}", self.path.display(), e);
        }
        self.path
    }
}

/// Owns the FUSE session of a drive
pub struct MountController {
    config: MountConfig,
    metadata: MetadataStore,
    fs: Arc<SpaceFs>,
    runtime: Handle,
    active: Mutex<Option<ActiveMount>>,
}

impl MountController {
    pub fn new(config: MountConfig, metadata: MetadataStore, fs: Arc<SpaceFs>, runtime: Handle) -> Self {
        MountController {
            config,
            metadata,
            fs,
            runtime,
            active: Mutex::new(None),
        }
    }

    /// Mount the drive and serve it in the background; returns the mount point
    pub fn mount(&self) -> Result<PathBuf> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::AlreadyMounted);
        }

        let path = resolve_mount_path(&expand_tilde(&self.config.mount_point))?;
        std::fs::create_dir_all(&path)?;

        let drive = DriveFs::new(
            self.fs.clone(),
            self.runtime.clone(),
            self.config.uid,
            self.config.gid,
        );
        let session = fuser::spawn_mount2(drive, &path, &mount_options(&self.config))?;
        *active = Some(ActiveMount {
            session,
            path: path.clone(),
        });
        drop(active);

        set_mount_flag(&self.metadata, true)?;
        info!("Mounted {} at {}", self.config.drive_name, path.display());
        Ok(path)
    }

    /// End the session and remember the drive as unmounted
    pub fn unmount(&self) -> Result<()> {
        let mounted = self.active.lock().take().ok_or(Error::NotMounted)?;
        let path = mounted.end();
        set_mount_flag(&self.metadata, false)?;
        info!("Unmounted {}", path.display());
        Ok(())
    }

    /// End the session but keep the drive marked as mounted for the next start
    pub fn shutdown(&self) {
        let mounted = self.active.lock().take();
        if let Some(mounted) = mounted {
            info!("Released {}", mounted.end().display());
        }
    }

    /// False once the kernel has dropped the session, e.g. after `fusermount -u`
    pub fn is_serving(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|mounted| !mounted.session.guard.is_finished())
    }

    /// Remount if the drive was mounted at last shutdown
    pub fn restore(&self) -> Result<Option<PathBuf>> {
        if !self.config.auto_mount || !should_mount(&self.metadata)? {
            return Ok(None);
        }
        self.mount().map(Some)
    }

    pub fn should_mount(&self) -> Result<bool> {
        should_mount(&self.metadata)
    }

    pub fn state(&self) -> MountState {
        match self.active.lock().as_ref() {
            Some(mounted) => MountState::Mounted {
                path: mounted.path.clone(),
            },
            None => MountState::Unmounted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::NoSharedFiles;
    use crate::space::tests::test_service;

    #[test]
    fn test_free_path_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("Space");
        assert_eq!(resolve_mount_path(&wanted).unwrap(), wanted);

        let trailing = PathBuf::from(format!("{}/", wanted.display()));
        assert_eq!(resolve_mount_path(&trailing).unwrap(), wanted);
    }

    #[test]
    fn test_taken_path_gets_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("Space");
        std::fs::create_dir(&wanted).unwrap();
        std::fs::create_dir(dir.path().join("Space0")).unwrap();

        assert_eq!(resolve_mount_path(&wanted).unwrap(), dir.path().join("Space1"));

        for i in 1..10 {
            std::fs::create_dir(dir.path().join(format!("Space{}", i))).unwrap();
        }
        assert!(matches!(
            resolve_mount_path(&wanted),
            Err(Error::MountPathUnavailable(_))
        ));
    }

    #[test]
    fn test_mount_flag() {
        let store = MetadataStore::in_memory().unwrap();
        assert!(!should_mount(&store).unwrap());

        set_mount_flag(&store, true).unwrap();
        assert!(should_mount(&store).unwrap());
        assert_eq!(store.get_state(MOUNT_FLAG_KEY).unwrap().unwrap(), b"true");

        set_mount_flag(&store, false).unwrap();
        assert!(!should_mount(&store).unwrap());

        store.save_state(MOUNT_FLAG_KEY, b"TRUE").unwrap();
        assert!(!should_mount(&store).unwrap());
    }

    #[tokio::test]
    async fn test_controller_starts_unmounted() {
        let (dir, service) = test_service().await;
        let store = service.registry().metadata().clone();
        let fs = Arc::new(SpaceFs::with_space(
            service,
            "personal",
            Arc::new(NoSharedFiles),
            &dir.path().join("scratch"),
        ));
        let config = MountConfig {
            mount_point: dir.path().join("Space"),
            auto_mount: false,
            ..MountConfig::default()
        };
        let controller = MountController::new(config, store.clone(), fs, Handle::current());

        assert_eq!(controller.state(), MountState::Unmounted);
        assert!(!controller.is_serving());
        controller.shutdown();
        assert!(matches!(controller.unmount(), Err(Error::NotMounted)));

        set_mount_flag(&store, true).unwrap();
        assert!(controller.should_mount().unwrap());
        // auto_mount disabled: no mount attempt
        assert_eq!(controller.restore().unwrap(), None);
    }
}
