//! Filesystem adapter
//!
//! Maps path-based drive operations onto buckets. [`SpaceFs`] is the root:
//! it routes each path to the data source of its top level folder and owns
//! the inode and open-handle tables the kernel binding relies on.

mod datasource;
mod entry;
mod files;
mod handler;
mod nodes;
mod shared;
mod spacefs;

pub use datasource::{is_dir_mode, FileHandle, FsDataSource, TlfDataSource};
pub use entry::{base_name, normalize_path, parent_path, DirEntry, EntryModes};
pub use files::FilesDataSource;
pub use handler::{FileHandler, ItemUploader};
pub use nodes::{NodeTable, ROOT_INODE};
pub use shared::{
    NoSharedFiles, SharedEntry, SharedFilesProvider, SharedLookupCache, SharedWithMeDataSource,
};
pub use spacefs::{SpaceFs, FILES_FOLDER, SHARED_FOLDER};

/// Regular file permissions (-rw-------)
pub const FILE_MODE: u32 = 0o600;

/// Directory permissions (drwx------)
pub const DIR_MODE: u32 = 0o700;

/// Read-only directory permissions (dr-x------)
pub const RESTRICTED_DIR_MODE: u32 = 0o500;

/// Names never shown in listings: the directory marker and OS metadata
pub const HIDDEN_NAMES: &[&str] = &[
    ".keep",
    ".Trashes",
    ".localized",
    ".fseventsd",
    ".ql_disablethumbnails",
    ".ql_disablecache",
];

pub fn is_hidden_name(name: &str) -> bool {
    HIDDEN_NAMES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_names() {
        assert!(is_hidden_name(".keep"));
        assert!(is_hidden_name(".fseventsd"));
        assert!(!is_hidden_name(".bashrc"));
        assert!(!is_hidden_name("keep"));
    }
}
