//! Data source and file handle contracts

use crate::error::Result;
use crate::fs::entry::DirEntry;
use async_trait::async_trait;
use std::sync::Arc;

/// An open file: positional reads and writes against local content
#[async_trait]
pub trait FileHandle: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize>;

    fn truncate(&self, size: u64) -> Result<()>;

    /// Current size of the local content
    fn size(&self) -> Result<u64>;

    /// True once the content differs from what was opened
    fn is_dirty(&self) -> bool;

    /// Flush changes back to their source and release local resources
    async fn close(&self) -> Result<()>;
}

/// Source of entries for one subtree of the drive.
///
/// Paths are absolute within the source: `/` is the source's own root.
#[async_trait]
pub trait FsDataSource: Send + Sync {
    /// A single entry, file or directory
    async fn get(&self, path: &str) -> Result<DirEntry>;

    /// Direct children of a directory
    async fn get_children(&self, path: &str) -> Result<Vec<DirEntry>>;

    async fn open(&self, path: &str) -> Result<Box<dyn FileHandle>>;

    /// Create a file, or a directory when `mode` carries `S_IFDIR`
    async fn create_entry(&self, path: &str, mode: u32) -> Result<DirEntry>;

    async fn rename_entry(&self, old_path: &str, new_path: &str) -> Result<()>;

    async fn delete_entry(&self, path: &str) -> Result<()>;
}

/// True if a mode passed to `create_entry` asks for a directory
pub fn is_dir_mode(mode: u32) -> bool {
    (mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
}

/// A data source mounted as a top level folder of the drive
#[derive(Clone)]
pub struct TlfDataSource {
    pub name: String,
    /// Absolute drive path of the folder, e.g. `/Files`
    pub base_path: String,
    pub source: Arc<dyn FsDataSource>,
}

impl TlfDataSource {
    pub fn new(name: impl Into<String>, source: Arc<dyn FsDataSource>) -> Self {
        let name = name.into();
        TlfDataSource {
            base_path: format!("/{}", name),
            name,
            source,
        }
    }

    /// True if `path` is this folder or lies below it
    pub fn contains(&self, path: &str) -> bool {
        path == self.base_path
            || path
                .strip_prefix(&self.base_path)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Path inside the source for a drive path
    pub fn child_path(&self, path: &str) -> String {
        match path.strip_prefix(&self.base_path) {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => "/".to_string(),
        }
    }

    /// Drive path for a path inside the source
    pub fn parent_path(&self, path: &str) -> String {
        if path == "/" || path.is_empty() {
            self.base_path.clone()
        } else {
            format!("{}{}", self.base_path, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl FsDataSource for Nothing {
        async fn get(&self, path: &str) -> Result<DirEntry> {
            Err(crate::error::Error::NotFound(path.to_string()))
        }
        async fn get_children(&self, _path: &str) -> Result<Vec<DirEntry>> {
            Ok(Vec::new())
        }
        async fn open(&self, path: &str) -> Result<Box<dyn FileHandle>> {
            Err(crate::error::Error::NotFound(path.to_string()))
        }
        async fn create_entry(&self, path: &str, _mode: u32) -> Result<DirEntry> {
            Err(crate::error::Error::NotSupported(path.to_string()))
        }
        async fn rename_entry(&self, old_path: &str, _new_path: &str) -> Result<()> {
            Err(crate::error::Error::NotSupported(old_path.to_string()))
        }
        async fn delete_entry(&self, path: &str) -> Result<()> {
            Err(crate::error::Error::NotSupported(path.to_string()))
        }
    }

    #[test]
    fn test_tlf_path_mapping() {
        let tlf = TlfDataSource::new("Files", Arc::new(Nothing));
        assert!(tlf.contains("/Files"));
        assert!(tlf.contains("/Files/a"));
        assert!(!tlf.contains("/FilesX"));
        assert_eq!(tlf.child_path("/Files"), "/");
        assert_eq!(tlf.child_path("/Files/a/b"), "/a/b");
        assert_eq!(tlf.parent_path("/a/b"), "/Files/a/b");
        assert_eq!(tlf.parent_path("/"), "/Files");
    }

    #[test]
    fn test_dir_mode() {
        assert!(is_dir_mode(libc::S_IFDIR as u32 | 0o755));
        assert!(!is_dir_mode(libc::S_IFREG as u32 | 0o644));
        assert!(!is_dir_mode(0o644));
    }
}
