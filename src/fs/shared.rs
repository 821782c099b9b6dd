//! "Shared With Me" data source
//!
//! A flat, read-only folder of files other users shared. Listings come
//! from an external [`SharedFilesProvider`]; each listing refreshes a
//! lookup cache that maps drive paths back to the bucket holding the file.

use crate::error::{Error, Result};
use crate::fs::datasource::{FileHandle, FsDataSource};
use crate::fs::entry::{base_name, normalize_path, DirEntry, EntryModes};
use crate::fs::handler::FileHandler;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Most entries requested from the provider per listing
pub const DEFAULT_SHARED_LIMIT: usize = 1000;

/// A file someone shared, and where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEntry {
    /// Entry with a path relative to the shared folder, e.g. `/report.pdf`
    pub entry: DirEntry,
    pub db_id: String,
    pub bucket_slug: String,
}

/// Source of shared files
#[async_trait]
pub trait SharedFilesProvider: Send + Sync {
    async fn shared_with_me(&self, limit: usize) -> Result<Vec<SharedEntry>>;

    /// Write the plaintext of a shared file into `writer`
    async fn fetch_shared_file(&self, shared: &SharedEntry, writer: &mut (dyn Write + Send)) -> Result<()>;
}

/// Provider for drives with no sharing backend
pub struct NoSharedFiles;

#[async_trait]
impl SharedFilesProvider for NoSharedFiles {
    async fn shared_with_me(&self, _limit: usize) -> Result<Vec<SharedEntry>> {
        Ok(Vec::new())
    }

    async fn fetch_shared_file(&self, shared: &SharedEntry, _writer: &mut (dyn Write + Send)) -> Result<()> {
        Err(Error::NotFound(shared.entry.path.clone()))
    }
}

/// Path -> shared entry, refreshed by every listing.
///
/// The lock is never held across an await.
#[derive(Default)]
pub struct SharedLookupCache {
    entries: RwLock<HashMap<String, SharedEntry>>,
}

impl SharedLookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_all(&self, items: &[SharedEntry]) {
        let mut entries = self.entries.write();
        for item in items {
            entries.insert(item.entry.path.clone(), item.clone());
        }
    }

    pub fn get(&self, path: &str) -> Option<SharedEntry> {
        self.entries.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub struct SharedWithMeDataSource {
    provider: Arc<dyn SharedFilesProvider>,
    cache: SharedLookupCache,
    scratch_dir: PathBuf,
    modes: EntryModes,
    limit: usize,
}

impl SharedWithMeDataSource {
    pub fn new(
        provider: Arc<dyn SharedFilesProvider>,
        scratch_dir: impl Into<PathBuf>,
        modes: EntryModes,
    ) -> Self {
        SharedWithMeDataSource {
            provider,
            cache: SharedLookupCache::new(),
            scratch_dir: scratch_dir.into(),
            modes,
            limit: DEFAULT_SHARED_LIMIT,
        }
    }

    pub fn cache(&self) -> &SharedLookupCache {
        &self.cache
    }

    /// Fetch the listing and refresh the cache with it
    async fn refresh(&self) -> Result<Vec<SharedEntry>> {
        let mut items = self.provider.shared_with_me(self.limit).await?;
        for item in &mut items {
            item.entry.path = normalize_path(&item.entry.path);
            item.entry.mode = self.modes.file;
        }
        self.cache.insert_all(&items);
        Ok(items)
    }

    async fn lookup(&self, path: &str) -> Result<SharedEntry> {
        if let Some(shared) = self.cache.get(path) {
            return Ok(shared);
        }
        self.refresh()
            .await?
            .into_iter()
            .find(|item| item.entry.path == path)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn read_only(&self, path: &str) -> Error {
        Error::NotSupported(format!("Shared With Me is read-only: {}", path))
    }
}

#[async_trait]
impl FsDataSource for SharedWithMeDataSource {
    async fn get(&self, path: &str) -> Result<DirEntry> {
        if path == "/" || path.is_empty() {
            return Ok(DirEntry::directory("/", self.modes.restricted_dir));
        }
        debug!("SharedWithMeDataSource::get: path={}", path);
        Ok(self.lookup(path).await?.entry)
    }

    /// Shared items are files only, so anything below the root is empty
    async fn get_children(&self, path: &str) -> Result<Vec<DirEntry>> {
        debug!("SharedWithMeDataSource::get_children: path={}", path);
        if path != "/" && !path.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.refresh().await?.into_iter().map(|item| item.entry).collect())
    }

    async fn open(&self, path: &str) -> Result<Box<dyn FileHandle>> {
        debug!("SharedWithMeDataSource::open: path={}", path);
        let shared = self.lookup(path).await?;

        let location = self
            .scratch_dir
            .join(format!("{}-{}", Uuid::new_v4().simple(), base_name(path)));
        let mut file = File::create(&location)?;
        if let Err(e) = self.provider.fetch_shared_file(&shared, &mut file).await {
            drop(file);
            let _ = std::fs::remove_file(&location);
            return Err(e);
        }
        drop(file);

        let handler = FileHandler::read_only(location, path, &shared.bucket_slug)?;
        Ok(Box::new(handler))
    }

    async fn create_entry(&self, path: &str, _mode: u32) -> Result<DirEntry> {
        Err(self.read_only(path))
    }

    async fn rename_entry(&self, old_path: &str, _new_path: &str) -> Result<()> {
        Err(self.read_only(old_path))
    }

    async fn delete_entry(&self, path: &str) -> Result<()> {
        Err(self.read_only(path))
    }
}
