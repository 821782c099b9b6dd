//! Directory entries as seen by the drive

use crate::bucket::{join_path, PathItem};
use crate::config::MountConfig;
use crate::fs::{DIR_MODE, FILE_MODE, RESTRICTED_DIR_MODE};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Permission bits handed out for drive entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryModes {
    pub file: u32,
    pub dir: u32,
    /// Top level folders the user may list but not modify
    pub restricted_dir: u32,
}

impl Default for EntryModes {
    fn default() -> Self {
        EntryModes {
            file: FILE_MODE,
            dir: DIR_MODE,
            restricted_dir: RESTRICTED_DIR_MODE,
        }
    }
}

impl From<&MountConfig> for EntryModes {
    fn from(config: &MountConfig) -> Self {
        EntryModes {
            file: config.file_mode,
            dir: config.dir_mode,
            restricted_dir: config.restricted_dir_mode,
        }
    }
}

/// A file or directory in the drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Absolute path, `/`-separated
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    /// Plaintext size in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Extension without the dot, empty for none
    pub extension: String,
    /// Permission bits
    pub mode: u32,
}

impl DirEntry {
    pub fn directory(path: &str, mode: u32) -> Self {
        let now = Utc::now();
        DirEntry {
            path: normalize_path(path),
            name: base_name(path).to_string(),
            is_dir: true,
            size: 0,
            created_at: now,
            updated_at: now,
            extension: String::new(),
            mode,
        }
    }

    pub fn file(path: &str, size: u64, updated_at: DateTime<Utc>, mode: u32) -> Self {
        let name = base_name(path);
        DirEntry {
            path: normalize_path(path),
            name: name.to_string(),
            is_dir: false,
            size,
            created_at: updated_at,
            updated_at,
            extension: extension_of(name),
            mode,
        }
    }

    /// Entry for a listed bucket item that lives in `dir`
    pub fn from_item(dir: &str, item: &PathItem, modes: &EntryModes) -> Self {
        let path = format!("/{}", join_path(dir, &item.name));
        if item.is_dir {
            DirEntry {
                updated_at: item.updated_at,
                created_at: item.updated_at,
                size: item.size,
                ..DirEntry::directory(&path, modes.dir)
            }
        } else {
            DirEntry::file(&path, item.size, item.updated_at, modes.file)
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Same entry re-rooted under `prefix`
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        self.path = if self.path == "/" {
            normalize_path(prefix)
        } else {
            format!("{}{}", prefix, self.path)
        };
        self
    }
}

/// Leading slash, no trailing slash, no empty segments
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Last segment of a path; empty for the root
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Parent of a normalized path; the root is its own parent
pub fn parent_path(path: &str) -> String {
    let path = normalize_path(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("a//b/"), "/a/b");
        assert_eq!(base_name("/a/b.txt"), "b.txt");
        assert_eq!(base_name("/"), "");
        assert_eq!(parent_path("/a/b"), "/a");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn test_file_entry_extension() {
        let now = Utc::now();
        assert_eq!(DirEntry::file("/x/report.tar.gz", 1, now, FILE_MODE).extension, "gz");
        assert_eq!(DirEntry::file("/.bashrc", 1, now, FILE_MODE).extension, "");
        assert_eq!(DirEntry::file("/Makefile", 1, now, FILE_MODE).extension, "");
    }

    #[test]
    fn test_with_prefix() {
        let entry = DirEntry::directory("/docs", DIR_MODE).with_prefix("/Files");
        assert_eq!(entry.path, "/Files/docs");
        let root = DirEntry::directory("/", DIR_MODE).with_prefix("/Files");
        assert_eq!(root.path, "/Files");
    }
}
