//! "Files" data source: the user's default bucket

use crate::error::{Error, Result};
use crate::fs::datasource::{is_dir_mode, FileHandle, FsDataSource};
use crate::fs::entry::{base_name, parent_path, DirEntry};
use crate::fs::handler::{FileHandler, ItemUploader};
use crate::fs::is_hidden_name;
use crate::space::SpaceService;
use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves the contents of one bucket through the [`SpaceService`]
pub struct FilesDataSource {
    service: Arc<SpaceService>,
    bucket_slug: String,
}

impl FilesDataSource {
    pub fn new(service: Arc<SpaceService>, bucket_slug: impl Into<String>) -> Self {
        FilesDataSource {
            service,
            bucket_slug: bucket_slug.into(),
        }
    }
}

#[async_trait]
impl FsDataSource for FilesDataSource {
    async fn get(&self, path: &str) -> Result<DirEntry> {
        let modes = self.service.modes();
        if path == "/" || path.is_empty() {
            return Ok(DirEntry::directory("/", modes.dir));
        }
        debug!("FilesDataSource::get: path={}", path);

        let name = base_name(path);
        let siblings = match self
            .service
            .list_directory(&parent_path(path), &self.bucket_slug)
            .await
        {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Err(Error::NotFound(path.to_string())),
            Err(e) => return Err(e),
        };

        siblings
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<DirEntry>> {
        debug!("FilesDataSource::get_children: path={}", path);
        self.service.list_directory(path, &self.bucket_slug).await
    }

    async fn open(&self, path: &str) -> Result<Box<dyn FileHandle>> {
        debug!("FilesDataSource::open: path={}", path);
        let info = self.service.open_file(path, &self.bucket_slug).await?;
        let uploader: Arc<dyn ItemUploader> = self.service.clone();
        let handler = FileHandler::open(uploader, info.location, path, &self.bucket_slug)?;
        Ok(Box::new(handler))
    }

    async fn create_entry(&self, path: &str, mode: u32) -> Result<DirEntry> {
        debug!("FilesDataSource::create_entry: path={}, mode={:o}", path, mode);
        let modes = self.service.modes();

        if is_dir_mode(mode) {
            self.service.create_folder(path, &self.bucket_slug).await?;
            return Ok(DirEntry::directory(path, modes.dir));
        }

        self.service
            .add_item_with_reader(path, Box::new(io::empty()), &self.bucket_slug)
            .await?;
        Ok(DirEntry::file(path, 0, Utc::now(), modes.file))
    }

    /// Only directories without visible content can be renamed
    async fn rename_entry(&self, old_path: &str, new_path: &str) -> Result<()> {
        debug!("FilesDataSource::rename_entry: {} -> {}", old_path, new_path);
        let entry = self.get(old_path).await?;
        if !entry.is_dir {
            warn!("Renaming files is not supported: {}", old_path);
            return Err(Error::NotSupported(format!("rename of file {}", old_path)));
        }

        let children = self.get_children(old_path).await?;
        if !children.iter().all(|child| is_hidden_name(&child.name)) {
            warn!("Renaming non-empty directories is not supported: {}", old_path);
            return Err(Error::NotSupported(format!("rename of non-empty directory {}", old_path)));
        }

        if let Err(e) = self.service.create_folder(new_path, &self.bucket_slug).await {
            warn!("Failed to create {} for rename: {}", new_path, e);
            return Err(Error::NotSupported(format!("rename to {}", new_path)));
        }
        self.service
            .remove_dir_or_file(old_path, &self.bucket_slug)
            .await
    }

    async fn delete_entry(&self, path: &str) -> Result<()> {
        debug!("FilesDataSource::delete_entry: path={}", path);
        self.service.remove_dir_or_file(path, &self.bucket_slug).await
    }
}
