//! FUSE binding of the drive
//!
//! Each callback resolves its inode to a drive path, runs the matching
//! [`SpaceFs`] operation to completion on the daemon's runtime and replies.

use crate::error::Error;
use crate::fs::{normalize_path, parent_path, DirEntry, SpaceFs};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, error};

/// TTL for cached attributes
const TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u32 = 4096;

/// Kernel-facing filesystem over a [`SpaceFs`]
pub struct DriveFs {
    fs: Arc<SpaceFs>,
    /// Runtime the async drive operations run on
    runtime: Handle,
    uid: u32,
    gid: u32,
}

/// Log unexpected failures and map to an errno; missing entries are routine
fn errno(op: &str, e: &Error) -> libc::c_int {
    if e.is_not_found() {
        debug!("{}: {}", op, e);
    } else {
        error!("{} error: {}", op, e);
    }
    e.to_errno()
}

impl DriveFs {
    pub fn new(fs: Arc<SpaceFs>, runtime: Handle, uid: u32, gid: u32) -> Self {
        DriveFs {
            fs,
            runtime,
            uid,
            gid,
        }
    }

    /// Helper to run async code from sync FUSE callbacks
    fn block_on<F: std::future::Future>(&self, f: F) -> F::Output {
        self.runtime.block_on(f)
    }

    fn attr(&self, ino: u64, entry: &DirEntry) -> FileAttr {
        let mtime: SystemTime = entry.updated_at.into();
        let (kind, nlink) = if entry.is_dir {
            (FileType::Directory, 2)
        } else {
            (FileType::RegularFile, 1)
        };

        FileAttr {
            ino,
            size: entry.size,
            blocks: entry.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: entry.created_at.into(),
            kind,
            perm: (entry.mode & 0o7777) as u16,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path(&self, ino: u64) -> Result<String, libc::c_int> {
        self.fs.path_for(ino).map_err(|e| errno("path", &e))
    }

    /// Drive path of `name` inside the directory `parent`
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let parent = self.path(parent)?;
        Ok(normalize_path(&format!("{}/{}", parent, name)))
    }

    /// Fetch an entry and the inode it is known by
    fn entry(&self, path: &str) -> crate::error::Result<(u64, FileAttr)> {
        let entry = self.block_on(self.fs.get(path))?;
        let ino = self.fs.inode_for(path);
        Ok((ino, self.attr(ino, &entry)))
    }

    fn lookup_child(&self, parent: u64, name: &OsStr) -> Result<FileAttr, libc::c_int> {
        let path = self.child_path(parent, name)?;
        debug!("lookup: parent={}, path={}", parent, path);
        self.entry(&path)
            .map(|(_, attr)| attr)
            .map_err(|e| errno("lookup", &e))
    }

    fn attr_of(&self, ino: u64) -> Result<FileAttr, libc::c_int> {
        let path = self.path(ino)?;
        self.entry(&path)
            .map(|(_, attr)| attr)
            .map_err(|e| errno("getattr", &e))
    }

    fn resize(&self, ino: u64, size: Option<u64>) -> Result<FileAttr, libc::c_int> {
        let path = self.path(ino)?;
        if let Some(size) = size {
            self.block_on(self.fs.truncate(&path, size))
                .map_err(|e| errno("setattr", &e))?;
        }
        self.entry(&path)
            .map(|(_, attr)| attr)
            .map_err(|e| errno("setattr", &e))
    }

    fn dir_entries(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, libc::c_int> {
        let path = self.path(ino)?;
        let children = self
            .block_on(self.fs.get_children(&path))
            .map_err(|e| errno("readdir", &e))?;

        let parent_ino = self.fs.inode_for(&parent_path(&path));
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let kind = if child.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((self.fs.inode_for(&child.path), kind, child.name));
        }
        Ok(entries)
    }

    fn open_file(&self, ino: u64) -> Result<u64, libc::c_int> {
        let path = self.path(ino)?;
        let opened = self.block_on(async {
            let entry = self.fs.get(&path).await?;
            if entry.is_dir {
                return Ok(None);
            }
            self.fs.open(&path).await.map(Some)
        });
        match opened {
            Ok(Some(fh)) => Ok(fh),
            Ok(None) => Err(libc::EISDIR),
            Err(e) => Err(errno("open", &e)),
        }
    }

    fn read_file_data(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, libc::c_int> {
        let handle = self.fs.handle(fh).map_err(|e| errno("read", &e))?;
        let mut buf = vec![0u8; size as usize];
        let n = handle
            .read_at(&mut buf, offset.max(0) as u64)
            .map_err(|e| errno("read", &e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_file_data(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32, libc::c_int> {
        self.fs
            .handle(fh)
            .and_then(|handle| handle.write_at(data, offset.max(0) as u64))
            .map(|n| n as u32)
            .map_err(|e| errno("write", &e))
    }

    fn release_file(&self, fh: u64) -> Result<(), libc::c_int> {
        self.block_on(self.fs.release(fh))
            .map_err(|e| errno("release", &e))
    }

    /// Create a file and open it right away
    fn create_file(&self, parent: u64, name: &OsStr, mode: u32) -> Result<(FileAttr, u64), libc::c_int> {
        let path = self.child_path(parent, name)?;
        debug!("create: path={}, mode={:o}", path, mode);

        let created = self.block_on(async {
            let entry = self.fs.create_entry(&path, mode).await?;
            let fh = self.fs.open(&path).await?;
            Ok::<_, Error>((entry, fh))
        });
        let (entry, fh) = created.map_err(|e| errno("create", &e))?;
        let ino = self.fs.inode_for(&path);
        Ok((self.attr(ino, &entry), fh))
    }

    fn create_directory(&self, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr, libc::c_int> {
        let path = self.child_path(parent, name)?;
        debug!("mkdir: path={}, mode={:o}", path, mode);

        let entry = self
            .block_on(self.fs.create_entry(&path, mode | libc::S_IFDIR as u32))
            .map_err(|e| errno("mkdir", &e))?;
        let ino = self.fs.inode_for(&path);
        Ok(self.attr(ino, &entry))
    }

    fn remove_entry(&self, op: &str, parent: u64, name: &OsStr) -> Result<(), libc::c_int> {
        let path = self.child_path(parent, name)?;
        debug!("{}: path={}", op, path);
        self.block_on(self.fs.delete_entry(&path))
            .map_err(|e| errno(op, &e))
    }

    fn move_entry(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<(), libc::c_int> {
        let old_path = self.child_path(parent, name)?;
        let new_path = self.child_path(newparent, newname)?;
        debug!("rename: {} -> {}", old_path, new_path);
        self.block_on(self.fs.rename_entry(&old_path, &new_path))
            .map_err(|e| errno("rename", &e))
    }
}

impl Filesystem for DriveFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        match self.attr_of(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    /// Only size changes are honored; ownership and permissions are fixed
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}, size={:?}", ino, size);

        match self.resize(ino, size) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={}", ino, flags);

        match self.open_file(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, fh={}, offset={}, size={}", ino, fh, offset, size);

        match self.read_file_data(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={}, fh={}, offset={}, size={}", ino, fh, offset, data.len());

        match self.write_file_data(fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: ino={}, fh={}", ino, fh);

        match self.release_file(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_file(parent, name, mode) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.create_directory(parent, name, mode) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry("unlink", parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry("rmdir", parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.move_entry(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        // Remote capacity is not tracked; report a large fixed volume
        reply.statfs(
            1_000_000, // blocks
            500_000,   // bfree
            500_000,   // bavail
            1_000_000, // files
            500_000,   // ffree
            BLOCK_SIZE,
            255, // namelen
            BLOCK_SIZE,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{NoSharedFiles, ROOT_INODE};
    use crate::space::tests::test_service;
    use chrono::Utc;

    fn drive(fs: Arc<SpaceFs>) -> DriveFs {
        DriveFs::new(fs, Handle::current(), 1000, 1000)
    }

    #[tokio::test]
    async fn test_attr_mapping() {
        let (dir, service) = test_service().await;
        let fs = Arc::new(SpaceFs::with_space(
            service,
            "personal",
            Arc::new(NoSharedFiles),
            &dir.path().join("scratch"),
        ));
        let drive = drive(fs);

        let file = DirEntry::file("/Files/a.txt", 5000, Utc::now(), 0o600);
        let attr = drive.attr(7, &file);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.blocks, 2);
        assert_eq!((attr.uid, attr.gid), (1000, 1000));

        let dir_attr = drive.attr(ROOT_INODE, &DirEntry::directory("/", 0o500));
        assert_eq!(dir_attr.kind, FileType::Directory);
        assert_eq!(dir_attr.perm, 0o500);
        assert_eq!(dir_attr.nlink, 2);
    }

    #[tokio::test]
    async fn test_child_paths() {
        let (dir, service) = test_service().await;
        let fs = Arc::new(SpaceFs::with_space(
            service,
            "personal",
            Arc::new(NoSharedFiles),
            &dir.path().join("scratch"),
        ));
        let files_ino = fs.inode_for("/Files");
        let drive = drive(fs);

        assert_eq!(drive.child_path(ROOT_INODE, OsStr::new("Files")).unwrap(), "/Files");
        assert_eq!(drive.child_path(files_ino, OsStr::new("a.txt")).unwrap(), "/Files/a.txt");
        assert_eq!(drive.child_path(999, OsStr::new("x")), Err(libc::ENOENT));
    }

    /// Drive over a fresh space. Callbacks block on the runtime, so these
    /// tests call them from the plain test thread.
    fn drive_on(runtime: &tokio::runtime::Runtime) -> (tempfile::TempDir, Arc<SpaceFs>, DriveFs) {
        let (dir, service) = runtime.block_on(test_service());
        let fs = Arc::new(SpaceFs::with_space(
            service,
            "personal",
            Arc::new(NoSharedFiles),
            &dir.path().join("scratch"),
        ));
        let drive = DriveFs::new(fs.clone(), runtime.handle().clone(), 1000, 1000);
        (dir, fs, drive)
    }

    #[test]
    fn test_lookup_miss_is_enoent() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (_dir, fs, drive) = drive_on(&runtime);
        let files_ino = fs.inode_for("/Files");

        assert_eq!(
            drive.lookup_child(files_ino, OsStr::new("missing.txt")).unwrap_err(),
            libc::ENOENT
        );
        assert_eq!(drive.attr_of(4242).unwrap_err(), libc::ENOENT);
        assert_eq!(drive.open_file(files_ino), Err(libc::EISDIR));

        let files = drive.lookup_child(ROOT_INODE, OsStr::new("Files")).unwrap();
        assert_eq!(files.kind, FileType::Directory);
        assert_eq!(files.ino, files_ino);
    }

    #[test]
    fn test_create_write_release_persists() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (_dir, fs, drive) = drive_on(&runtime);
        let files_ino = fs.inode_for("/Files");

        let (attr, fh) = drive.create_file(files_ino, OsStr::new("notes.txt"), 0o644).unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 0);

        assert_eq!(drive.write_file_data(fh, 0, b"hello drive").unwrap(), 11);
        assert_eq!(drive.read_file_data(fh, 6, 64).unwrap(), b"drive");
        // size of unsaved writes comes from the open handle
        assert_eq!(drive.attr_of(attr.ino).unwrap().size, 11);
        drive.release_file(fh).unwrap();
        assert_eq!(fs.open_handle_count(), 0);
        assert_eq!(drive.read_file_data(fh, 0, 1), Err(libc::EBADF));

        let stored = drive.lookup_child(files_ino, OsStr::new("notes.txt")).unwrap();
        assert_eq!(stored.ino, attr.ino);
        assert_eq!(stored.size, 11);
        let names: Vec<String> = drive
            .dir_entries(files_ino)
            .unwrap()
            .into_iter()
            .map(|(_, _, name)| name)
            .collect();
        assert_eq!(names, vec![".", "..", "notes.txt"]);

        let fh = drive.open_file(stored.ino).unwrap();
        assert_eq!(drive.read_file_data(fh, 0, 64).unwrap(), b"hello drive");
        drive.release_file(fh).unwrap();
    }

    #[test]
    fn test_top_level_is_read_only() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (_dir, _fs, drive) = drive_on(&runtime);

        assert_eq!(
            drive.create_file(ROOT_INODE, OsStr::new("stray.txt"), 0o644).unwrap_err(),
            libc::EACCES
        );
        assert_eq!(
            drive.remove_entry("rmdir", ROOT_INODE, OsStr::new("Files")),
            Err(libc::EACCES)
        );
    }
}
