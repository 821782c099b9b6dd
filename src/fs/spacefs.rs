//! Drive root dispatcher
//!
//! [`SpaceFs`] presents the top level folders ("Files", "Shared With Me")
//! under a read-only root and routes every other path to the data source
//! owning its first segment. It owns the inode table and the table of
//! open file handles; one path never has more than one live handler.

use crate::error::{Error, Result};
use crate::fs::datasource::{FileHandle, TlfDataSource};
use crate::fs::entry::{normalize_path, parent_path, DirEntry, EntryModes};
use crate::fs::files::FilesDataSource;
use crate::fs::nodes::NodeTable;
use crate::fs::shared::{SharedFilesProvider, SharedWithMeDataSource};
use crate::space::SpaceService;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Folder backed by the default bucket
pub const FILES_FOLDER: &str = "Files";

/// Folder listing files shared by others
pub const SHARED_FOLDER: &str = "Shared With Me";

struct OpenFile {
    path: String,
    handle: Arc<dyn FileHandle>,
    refs: usize,
}

/// fh -> shared handler, path -> fh
#[derive(Default)]
struct HandleTable {
    next_fh: u64,
    files: HashMap<u64, OpenFile>,
    by_path: HashMap<String, u64>,
}

impl HandleTable {
    /// Reuse the live handler of `path`, if any
    fn share(&mut self, path: &str) -> Option<u64> {
        let fh = *self.by_path.get(path)?;
        let open = self.files.get_mut(&fh)?;
        open.refs += 1;
        Some(fh)
    }

    fn insert(&mut self, path: &str, handle: Arc<dyn FileHandle>) -> u64 {
        self.next_fh += 1;
        let fh = self.next_fh;
        self.files.insert(
            fh,
            OpenFile {
                path: path.to_string(),
                handle,
                refs: 1,
            },
        );
        self.by_path.insert(path.to_string(), fh);
        fh
    }

    fn get(&self, fh: u64) -> Option<Arc<dyn FileHandle>> {
        self.files.get(&fh).map(|open| open.handle.clone())
    }

    fn by_path(&self, path: &str) -> Option<Arc<dyn FileHandle>> {
        self.by_path.get(path).and_then(|fh| self.get(*fh))
    }

    /// Drop one reference; returns the handler once the last one is gone
    fn release(&mut self, fh: u64) -> Result<Option<Arc<dyn FileHandle>>> {
        let open = self.files.get_mut(&fh).ok_or(Error::InvalidFileHandle(fh))?;
        open.refs -= 1;
        if open.refs > 0 {
            return Ok(None);
        }
        let open = self.files.remove(&fh).ok_or(Error::InvalidFileHandle(fh))?;
        self.by_path.remove(&open.path);
        Ok(Some(open.handle))
    }
}

pub struct SpaceFs {
    sources: Vec<TlfDataSource>,
    nodes: RwLock<NodeTable>,
    handles: Mutex<HandleTable>,
    modes: EntryModes,
}

impl SpaceFs {
    pub fn new(sources: Vec<TlfDataSource>, modes: EntryModes) -> Self {
        SpaceFs {
            sources,
            nodes: RwLock::new(NodeTable::new()),
            handles: Mutex::new(HandleTable::default()),
            modes,
        }
    }

    /// Standard drive layout over a space service and a sharing provider
    pub fn with_space(
        service: Arc<SpaceService>,
        bucket_slug: &str,
        shared: Arc<dyn SharedFilesProvider>,
        scratch_dir: &Path,
    ) -> Self {
        let modes = service.modes();
        let files = FilesDataSource::new(service, bucket_slug);
        let shared = SharedWithMeDataSource::new(shared, scratch_dir, modes);
        SpaceFs::new(
            vec![
                TlfDataSource::new(FILES_FOLDER, Arc::new(files)),
                TlfDataSource::new(SHARED_FOLDER, Arc::new(shared)),
            ],
            modes,
        )
    }

    fn route(&self, path: &str) -> Result<(&TlfDataSource, String)> {
        self.sources
            .iter()
            .find(|tlf| tlf.contains(path))
            .map(|tlf| (tlf, tlf.child_path(path)))
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn is_top_level(path: &str) -> bool {
        path != "/" && parent_path(path) == "/"
    }

    /// Re-root an entry from a data source onto the drive
    fn to_drive(tlf: &TlfDataSource, entry: DirEntry) -> DirEntry {
        let mut entry = entry.with_prefix(&tlf.base_path);
        if entry.path == tlf.base_path {
            entry.name = tlf.name.clone();
        }
        entry
    }

    pub fn root_entry(&self) -> DirEntry {
        DirEntry::directory("/", self.modes.restricted_dir)
    }

    pub async fn get(&self, path: &str) -> Result<DirEntry> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(self.root_entry());
        }
        let (tlf, child) = self.route(&path)?;
        let mut entry = Self::to_drive(tlf, tlf.source.get(&child).await?);

        // unsaved writes are only visible in the open handler
        let open = self.handles.lock().by_path(&path);
        if let Some(handle) = open {
            entry.size = handle.size()?;
        }
        Ok(entry)
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = normalize_path(path);
        if path == "/" {
            let mut entries = Vec::with_capacity(self.sources.len());
            for tlf in &self.sources {
                entries.push(Self::to_drive(tlf, tlf.source.get("/").await?));
            }
            return Ok(entries);
        }

        let (tlf, child) = self.route(&path)?;
        Ok(tlf
            .source
            .get_children(&child)
            .await?
            .into_iter()
            .map(|entry| Self::to_drive(tlf, entry))
            .collect())
    }

    /// Open `path`, sharing the live handler if it is already open
    pub async fn open(&self, path: &str) -> Result<u64> {
        let path = normalize_path(path);
        let shared = self.handles.lock().share(&path);
        if let Some(fh) = shared {
            debug!("SpaceFs::open: sharing fh {} for {}", fh, path);
            return Ok(fh);
        }

        let (tlf, child) = self.route(&path)?;
        let handle: Arc<dyn FileHandle> = Arc::from(tlf.source.open(&child).await?);

        // another open may have won while we were downloading
        let raced = {
            let mut handles = self.handles.lock();
            match handles.share(&path) {
                Some(fh) => Err(fh),
                None => Ok(handles.insert(&path, handle.clone())),
            }
        };
        match raced {
            Ok(fh) => {
                debug!("SpaceFs::open: fh {} for {}", fh, path);
                Ok(fh)
            }
            Err(fh) => {
                handle.close().await?;
                Ok(fh)
            }
        }
    }

    pub fn handle(&self, fh: u64) -> Result<Arc<dyn FileHandle>> {
        self.handles
            .lock()
            .get(fh)
            .ok_or(Error::InvalidFileHandle(fh))
    }

    /// Release one reference to `fh`; the last release closes the handler
    pub async fn release(&self, fh: u64) -> Result<()> {
        let closing = self.handles.lock().release(fh)?;
        if let Some(handle) = closing {
            debug!("SpaceFs::release: closing fh {}", fh);
            handle.close().await?;
        }
        Ok(())
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.lock().files.len()
    }

    pub async fn create_entry(&self, path: &str, mode: u32) -> Result<DirEntry> {
        let path = normalize_path(path);
        if path == "/" || Self::is_top_level(&path) {
            return Err(Error::PermissionDenied);
        }
        let (tlf, child) = self.route(&path)?;
        let entry = tlf.source.create_entry(&child, mode).await?;
        Ok(Self::to_drive(tlf, entry))
    }

    pub async fn rename_entry(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_path = normalize_path(old_path);
        let new_path = normalize_path(new_path);
        if Self::is_top_level(&old_path) || Self::is_top_level(&new_path) {
            return Err(Error::PermissionDenied);
        }

        let (old_tlf, old_child) = self.route(&old_path)?;
        let (new_tlf, new_child) = self.route(&new_path)?;
        if old_tlf.base_path != new_tlf.base_path {
            return Err(Error::NotSupported(format!(
                "rename across folders: {} -> {}",
                old_path, new_path
            )));
        }

        old_tlf.source.rename_entry(&old_child, &new_child).await?;
        self.nodes.write().rename(&old_path, &new_path);
        Ok(())
    }

    pub async fn delete_entry(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        if path == "/" || Self::is_top_level(&path) {
            return Err(Error::PermissionDenied);
        }
        let (tlf, child) = self.route(&path)?;
        tlf.source.delete_entry(&child).await?;
        self.nodes.write().remove(&path);
        Ok(())
    }

    /// Resize a file, through its open handler if there is one
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = normalize_path(path);
        let open = self.handles.lock().by_path(&path);
        if let Some(handle) = open {
            return handle.truncate(size);
        }

        let fh = self.open(&path).await?;
        let truncated = self.handle(fh).and_then(|handle| handle.truncate(size));
        let released = self.release(fh).await;
        truncated.and(released)
    }

    pub fn inode_for(&self, path: &str) -> u64 {
        self.nodes.write().get_or_create(&normalize_path(path))
    }

    pub fn path_for(&self, ino: u64) -> Result<String> {
        self.nodes
            .read()
            .path(ino)
            .map(str::to_string)
            .ok_or(Error::InodeNotFound(ino))
    }
}
