//! Copy-on-open file handler
//!
//! Opening a drive file downloads its plaintext into a scratch file. Reads
//! and writes go to that copy; closing a modified copy uploads it back
//! through the service and removes the scratch file once the upload went
//! through.

use crate::bucket::BoxReader;
use crate::error::{Error, Result};
use crate::fs::datasource::FileHandle;
use crate::space::AddItemResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where closed, modified files are written back to
#[async_trait]
pub trait ItemUploader: Send + Sync {
    async fn add_item_with_reader(
        &self,
        path: &str,
        reader: BoxReader,
        bucket_slug: &str,
    ) -> Result<AddItemResult>;
}

/// Handle over a scratch copy of a bucket file
pub struct FileHandler {
    local_path: PathBuf,
    remote_path: String,
    bucket_slug: String,
    file: Mutex<Option<File>>,
    dirty: AtomicBool,
    /// `None` for read-only handles
    uploader: Option<Arc<dyn ItemUploader>>,
}

impl FileHandler {
    /// Writable handle; changes are uploaded through `uploader` on close
    pub fn open(
        uploader: Arc<dyn ItemUploader>,
        local_path: impl Into<PathBuf>,
        remote_path: &str,
        bucket_slug: &str,
    ) -> Result<Self> {
        Self::new(Some(uploader), local_path.into(), remote_path, bucket_slug)
    }

    /// Read-only handle; writes fail with `NotSupported`
    pub fn read_only(local_path: impl Into<PathBuf>, remote_path: &str, bucket_slug: &str) -> Result<Self> {
        Self::new(None, local_path.into(), remote_path, bucket_slug)
    }

    fn new(
        uploader: Option<Arc<dyn ItemUploader>>,
        local_path: PathBuf,
        remote_path: &str,
        bucket_slug: &str,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(uploader.is_some())
            .open(&local_path)?;
        debug!("Opened scratch copy {:?} for {}", local_path, remote_path);

        Ok(FileHandler {
            local_path,
            remote_path: remote_path.to_string(),
            bucket_slug: bucket_slug.to_string(),
            file: Mutex::new(Some(file)),
            dirty: AtomicBool::new(false),
            uploader,
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> std::io::Result<T>) -> Result<T> {
        let guard = self.file.lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("{} is already closed", self.remote_path)))?;
        Ok(f(file)?)
    }

    fn check_writable(&self) -> Result<()> {
        if self.uploader.is_none() {
            return Err(Error::NotSupported(format!("{} is read-only", self.remote_path)));
        }
        Ok(())
    }

    /// Send the whole scratch copy, from the start, to `uploader`
    async fn upload(&self, uploader: &dyn ItemUploader, file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let reader = file.try_clone()?;
        uploader
            .add_item_with_reader(&self.remote_path, Box::new(reader), &self.bucket_slug)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FileHandle for FileHandler {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_file(|file| {
            let mut total = 0;
            while total < buf.len() {
                let n = file.read_at(&mut buf[total..], offset + total as u64)?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            Ok(total)
        })
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.check_writable()?;
        self.with_file(|file| file.write_all_at(data, offset))?;
        self.dirty.store(true, Ordering::Release);
        Ok(data.len())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        self.with_file(|file| file.set_len(size))?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Upload a modified copy and drop the scratch file. A failed upload
    /// keeps both the scratch file and the open handle, still dirty.
    async fn close(&self) -> Result<()> {
        let Some(mut file) = self.file.lock().take() else {
            return Ok(());
        };

        if let Some(uploader) = self.uploader.as_ref().filter(|_| self.is_dirty()) {
            debug!("Uploading changes of {} to {}", self.remote_path, self.bucket_slug);
            if let Err(e) = self.upload(uploader.as_ref(), &mut file).await {
                warn!(
                    "Keeping scratch file {:?} after failed upload of {}: {}",
                    self.local_path, self.remote_path, e
                );
                *self.file.lock() = Some(file);
                return Err(e);
            }
            self.dirty.store(false, Ordering::Release);
        }

        drop(file);
        if let Err(e) = std::fs::remove_file(&self.local_path) {
            warn!("Failed to remove scratch file {:?}: {}", self.local_path, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<(String, Vec<u8>, String)>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ItemUploader for RecordingUploader {
        async fn add_item_with_reader(
            &self,
            path: &str,
            mut reader: BoxReader,
            bucket_slug: &str,
        ) -> Result<AddItemResult> {
            if self.failing.load(Ordering::Acquire) {
                return Err(Error::Remote("connection reset by peer".to_string()));
            }
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            let bytes = data.len() as u64;
            self.uploads
                .lock()
                .push((path.to_string(), data, bucket_slug.to_string()));
            Ok(AddItemResult {
                source_path: path.to_string(),
                bucket_path: path.to_string(),
                bytes,
                error: None,
            })
        }
    }

    fn scratch(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join(uuid::Uuid::new_v4().to_string());
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_clean_close_does_not_upload() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());
        let local = scratch(dir.path(), b"hello");
        let handler = FileHandler::open(uploader.clone(), &local, "/a.txt", "personal").unwrap();

        let mut buf = [0u8; 16];
        let n = handler.read_at(&mut buf, 1).unwrap();
        assert_eq!(&buf[..n], b"ello");
        assert!(!handler.is_dirty());

        handler.close().await.unwrap();
        assert!(uploader.uploads.lock().is_empty());
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_dirty_close_uploads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());
        let local = scratch(dir.path(), b"hello");
        let handler = FileHandler::open(uploader.clone(), &local, "/a.txt", "personal").unwrap();

        handler.write_at(b"J", 0).unwrap();
        handler.write_at(b"!!", 5).unwrap();
        assert!(handler.is_dirty());
        assert_eq!(handler.size().unwrap(), 7);

        handler.close().await.unwrap();
        let uploads = uploader.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0], ("/a.txt".to_string(), b"Jello!!".to_vec(), "personal".to_string()));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_truncate_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());
        let local = scratch(dir.path(), b"hello");
        let handler = FileHandler::open(uploader.clone(), &local, "/a.txt", "personal").unwrap();

        handler.truncate(2).unwrap();
        assert!(handler.is_dirty());
        handler.close().await.unwrap();
        assert_eq!(uploader.uploads.lock()[0].1, b"he".to_vec());
    }

    #[tokio::test]
    async fn test_read_only_handle() {
        let dir = tempfile::tempdir().unwrap();
        let local = scratch(dir.path(), b"shared");
        let handler = FileHandler::read_only(&local, "/s.txt", "shared-bucket").unwrap();

        assert!(matches!(handler.write_at(b"x", 0), Err(Error::NotSupported(_))));
        assert!(matches!(handler.truncate(0), Err(Error::NotSupported(_))));
        handler.close().await.unwrap();
        assert!(!local.exists());
        // closing twice is a no-op
        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());
        uploader.failing.store(true, Ordering::Release);
        let local = scratch(dir.path(), b"hello");
        let handler = FileHandler::open(uploader.clone(), &local, "/a.txt", "personal").unwrap();

        handler.write_at(b"J", 0).unwrap();
        assert!(matches!(handler.close().await, Err(Error::Remote(_))));
        assert!(local.exists());
        assert!(handler.is_dirty());
        assert_eq!(std::fs::read(&local).unwrap(), b"Jello");

        let mut buf = [0u8; 8];
        let n = handler.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"Jello");

        uploader.failing.store(false, Ordering::Release);
        handler.close().await.unwrap();
        assert_eq!(uploader.uploads.lock()[0].1, b"Jello".to_vec());
        assert!(!handler.is_dirty());
        assert!(!local.exists());
    }
}
