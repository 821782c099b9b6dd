//! Space service
//!
//! The operations the daemon exposes over its buckets: listing, opening
//! into a scratch copy, adding and removing items, folder creation and
//! backup toggles. Every mutation is reported to the synchronizer so the
//! mirror catches up in the background.

use crate::bucket::{join_path, visible_items, BoxReader, Bucket, BucketRegistry};
use crate::error::{Error, Result};
use crate::fs::{base_name, DirEntry, EntryModes, ItemUploader};
use crate::metadata::BucketRecord;
use crate::sync::SyncNotifier;
use async_trait::async_trait;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where an opened file's plaintext copy was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenFileInfo {
    pub location: PathBuf,
}

/// Outcome of adding one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddItemResult {
    pub source_path: String,
    pub bucket_path: String,
    pub bytes: u64,
    /// Set when this item failed; other items are still added
    pub error: Option<String>,
}

pub struct SpaceService {
    registry: Arc<BucketRegistry>,
    notifier: SyncNotifier,
    scratch_dir: PathBuf,
    modes: EntryModes,
}

/// Bucket-relative form of a drive path
fn bucket_path(path: &str) -> &str {
    path.trim_matches('/')
}

impl SpaceService {
    pub fn new(
        registry: Arc<BucketRegistry>,
        notifier: SyncNotifier,
        scratch_dir: impl Into<PathBuf>,
        modes: EntryModes,
    ) -> Self {
        SpaceService {
            registry,
            notifier,
            scratch_dir: scratch_dir.into(),
            modes,
        }
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    pub fn modes(&self) -> EntryModes {
        self.modes
    }

    fn bucket(&self, slug: &str) -> Result<Arc<Bucket>> {
        self.registry.get_bucket(slug)
    }

    /// Visible entries of a directory
    pub async fn list_directory(&self, path: &str, slug: &str) -> Result<Vec<DirEntry>> {
        let dir = bucket_path(path);
        let listing = self.bucket(slug)?.list_directory(dir).await?;
        if !listing.item.is_dir {
            return Err(Error::NotFound(format!("{} is not a directory", path)));
        }
        Ok(visible_items(&listing)
            .into_iter()
            .map(|item| DirEntry::from_item(dir, item, &self.modes))
            .collect())
    }

    /// Download and decrypt a file into a fresh scratch file
    pub async fn open_file(&self, path: &str, slug: &str) -> Result<OpenFileInfo> {
        let bucket = self.bucket(slug)?;
        let location = self
            .scratch_dir
            .join(format!("{}-{}", Uuid::new_v4().simple(), base_name(path)));
        debug!("Opening {} from {} into {:?}", path, slug, location);

        let mut file = File::create(&location)?;
        if let Err(e) = bucket.get_file(bucket_path(path), &mut file).await {
            drop(file);
            let _ = fs::remove_file(&location);
            return Err(e);
        }
        Ok(OpenFileInfo { location })
    }

    pub async fn create_folder(&self, path: &str, slug: &str) -> Result<()> {
        self.bucket(slug)?
            .create_directory(bucket_path(path))
            .await
    }

    /// Upload local files and directory trees into `target_dir`.
    ///
    /// Each source gets its own result; a failure on one does not stop the rest.
    pub async fn add_items(
        &self,
        sources: &[PathBuf],
        target_dir: &str,
        slug: &str,
    ) -> Result<Vec<AddItemResult>> {
        let bucket = self.bucket(slug)?;
        let mut results = Vec::new();

        for source in sources {
            if source.is_dir() {
                self.add_directory(&bucket, source, bucket_path(target_dir), &mut results)
                    .await;
            } else {
                let target = join_path(target_dir, &file_name(source));
                results.push(self.add_file(&bucket, source, &target).await);
            }
        }
        Ok(results)
    }

    async fn add_directory(
        &self,
        bucket: &Bucket,
        source: &Path,
        target_dir: &str,
        results: &mut Vec<AddItemResult>,
    ) {
        let mut pending = vec![(source.to_path_buf(), join_path(target_dir, &file_name(source)))];

        while let Some((local_dir, remote_dir)) = pending.pop() {
            if let Err(e) = bucket.create_directory(&remote_dir).await {
                results.push(failed(&local_dir, &remote_dir, e));
                continue;
            }

            let entries = match fs::read_dir(&local_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    results.push(failed(&local_dir, &remote_dir, e.into()));
                    continue;
                }
            };
            for entry in entries.flatten() {
                let local = entry.path();
                let remote = join_path(&remote_dir, &file_name(&local));
                if local.is_dir() {
                    pending.push((local, remote));
                } else {
                    results.push(self.add_file(bucket, &local, &remote).await);
                }
            }
        }
    }

    async fn add_file(&self, bucket: &Bucket, source: &Path, target: &str) -> AddItemResult {
        let uploaded = async {
            let file = File::open(source)?;
            let bytes = file.metadata()?.len();
            bucket.upload_file(target, Box::new(file)).await?;
            Ok::<u64, Error>(bytes)
        }
        .await;

        match uploaded {
            Ok(bytes) => {
                self.notifier.notify_item_added(bucket.slug(), target);
                AddItemResult {
                    source_path: source.display().to_string(),
                    bucket_path: target.to_string(),
                    bytes,
                    error: None,
                }
            }
            Err(e) => failed(source, target, e),
        }
    }

    /// Upload `reader` as the content of `path`
    pub async fn add_item_with_reader(
        &self,
        path: &str,
        reader: BoxReader,
        slug: &str,
    ) -> Result<AddItemResult> {
        let bucket = self.bucket(slug)?;
        let target = bucket_path(path);
        let counted = CountingReader::new(reader);
        let bytes = counted.counter();

        bucket.upload_file(target, Box::new(counted)).await?;
        self.notifier.notify_item_added(slug, target);

        Ok(AddItemResult {
            source_path: path.to_string(),
            bucket_path: target.to_string(),
            bytes: bytes.load(Ordering::Acquire),
            error: None,
        })
    }

    pub async fn remove_dir_or_file(&self, path: &str, slug: &str) -> Result<()> {
        let target = bucket_path(path);
        self.bucket(slug)?.delete_dir_or_file(target).await?;
        self.notifier.notify_item_removed(slug, target);
        Ok(())
    }

    pub async fn toggle_bucket_backup(&self, slug: &str, enabled: bool) -> Result<()> {
        self.registry.metadata().set_bucket_backup(slug, enabled)?;
        info!("Backup for {} turned {}", slug, if enabled { "on" } else { "off" });
        if enabled {
            self.notifier.notify_bucket_backup_on(slug);
        } else {
            self.notifier.notify_bucket_backup_off(slug);
        }
        Ok(())
    }

    /// Create a bucket and schedule its mirror
    pub async fn create_bucket(&self, slug: &str) -> Result<BucketRecord> {
        self.registry.create_bucket(slug).await?;
        self.notifier.notify_bucket_created(slug);
        self.registry.metadata().get_bucket(slug)
    }

    /// Bring files back from the mirror
    pub async fn restore_bucket(&self, slug: &str) -> Result<()> {
        self.registry.metadata().get_bucket(slug)?;
        self.notifier.notify_bucket_restore(slug);
        Ok(())
    }
}

#[async_trait]
impl ItemUploader for SpaceService {
    async fn add_item_with_reader(
        &self,
        path: &str,
        reader: BoxReader,
        bucket_slug: &str,
    ) -> Result<AddItemResult> {
        SpaceService::add_item_with_reader(self, path, reader, bucket_slug).await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn failed(source: &Path, target: &str, error: Error) -> AddItemResult {
    warn!("Failed to add {:?} as {}: {}", source, target, error);
    AddItemResult {
        source_path: source.display().to_string(),
        bucket_path: target.to_string(),
        bytes: 0,
        error: Some(error.to_string()),
    }
}

/// Reader that counts the bytes passing through it
struct CountingReader {
    inner: BoxReader,
    count: Arc<AtomicU64>,
}

impl CountingReader {
    fn new(inner: BoxReader) -> Self {
        CountingReader {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl std::io::Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bucket::{LocalHub, MemoryBucketClient, StaticKeychain};
    use crate::config::{ListingPolicy, SyncConfig};
    use crate::metadata::MetadataStore;
    use crate::sync::{BucketTaskExecutor, Synchronizer, TaskKind};
    use std::io::Cursor;

    pub(crate) struct TestSpace {
        pub dir: tempfile::TempDir,
        pub registry: Arc<BucketRegistry>,
        pub hub: Arc<LocalHub>,
        pub sync: Arc<Synchronizer>,
        pub service: Arc<SpaceService>,
    }

    /// Service over in-memory buckets with a "personal" bucket, synchronizer not started
    pub(crate) async fn test_space() -> TestSpace {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        let hub = Arc::new(LocalHub::new(Arc::new(MemoryBucketClient::new())));
        let registry = Arc::new(BucketRegistry::new(
            Arc::new(MemoryBucketClient::new()),
            hub.clone(),
            MetadataStore::in_memory().unwrap(),
            ListingPolicy::default(),
        ));
        registry.create_bucket("personal").await.unwrap();

        let executor = Arc::new(BucketTaskExecutor::new(
            registry.clone(),
            Arc::new(StaticKeychain::new("test-identity")),
            &scratch,
        ));
        let sync = Arc::new(Synchronizer::new(
            registry.metadata().clone(),
            SyncConfig::default(),
            executor,
        ));
        let service = Arc::new(SpaceService::new(
            registry.clone(),
            sync.notifier(),
            &scratch,
            EntryModes::default(),
        ));

        TestSpace {
            dir,
            registry,
            hub,
            sync,
            service,
        }
    }

    pub(crate) async fn test_service() -> (tempfile::TempDir, Arc<SpaceService>) {
        let space = test_space().await;
        (space.dir, space.service)
    }

    #[tokio::test]
    async fn test_add_item_lists_and_opens() {
        let space = test_space().await;
        let service = &space.service;

        let result = service
            .add_item_with_reader("/docs/a.txt", Box::new(Cursor::new(b"hello".to_vec())), "personal")
            .await
            .unwrap();
        assert_eq!(result.bucket_path, "docs/a.txt");
        assert_eq!(result.bytes, 5);

        let entries = service.list_directory("/docs", "personal").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/docs/a.txt");
        assert_eq!(entries[0].size, 5);

        let info = service.open_file("/docs/a.txt", "personal").await.unwrap();
        assert_eq!(std::fs::read(&info.location).unwrap(), b"hello");
        assert!(info.location.starts_with(space.dir.path().join("scratch")));
    }

    #[tokio::test]
    async fn test_open_missing_file_leaves_no_scratch() {
        let space = test_space().await;
        let err = space
            .service
            .open_file("/nope.txt", "personal")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let scratch = space.dir.path().join("scratch");
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_add_items_from_disk() {
        let space = test_space().await;
        let src = space.dir.path().join("src");
        std::fs::create_dir_all(src.join("album/inner")).unwrap();
        std::fs::write(src.join("single.txt"), b"1").unwrap();
        std::fs::write(src.join("album/p1.jpg"), b"22").unwrap();
        std::fs::write(src.join("album/inner/p2.jpg"), b"333").unwrap();

        let results = space
            .service
            .add_items(
                &[src.join("single.txt"), src.join("album"), src.join("missing.txt")],
                "/",
                "personal",
            )
            .await
            .unwrap();

        let mut ok: Vec<_> = results
            .iter()
            .filter(|r| r.error.is_none())
            .map(|r| (r.bucket_path.as_str(), r.bytes))
            .collect();
        ok.sort();
        assert_eq!(
            ok,
            vec![("album/inner/p2.jpg", 3), ("album/p1.jpg", 2), ("single.txt", 1)]
        );
        assert_eq!(results.iter().filter(|r| r.error.is_some()).count(), 1);

        let bucket = space.registry.get_bucket("personal").unwrap();
        let mut files = bucket.walk("").await.unwrap();
        files.retain(|f| !f.ends_with(".keep"));
        files.sort();
        assert_eq!(files, vec!["album/inner/p2.jpg", "album/p1.jpg", "single.txt"]);
    }

    #[tokio::test]
    async fn test_mutations_notify_synchronizer() {
        let space = test_space().await;
        let service = &space.service;
        service
            .add_item_with_reader("a.txt", Box::new(Cursor::new(b"a".to_vec())), "personal")
            .await
            .unwrap();
        service.remove_dir_or_file("a.txt", "personal").await.unwrap();
        service.toggle_bucket_backup("personal", false).await.unwrap();

        let pending = space.sync.pending_tasks();
        let kinds: Vec<TaskKind> = pending.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskKind::AddItem,
                TaskKind::RemoveItem,
                TaskKind::BackupOff,
                TaskKind::PinFile,
                TaskKind::UnpinFile,
            ]
        );
        assert!(!space.registry.metadata().get_bucket("personal").unwrap().backup);
    }

    #[tokio::test]
    async fn test_create_bucket_schedules_mirror() {
        let space = test_space().await;
        let record = space.service.create_bucket("work").await.unwrap();
        assert_eq!(record.slug, "work");
        assert!(record.mirror.is_none());

        let pending = space.sync.pending_tasks();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TaskKind::CreateBucket);
        assert_eq!(pending[0].args, vec!["work".to_string()]);

        assert!(matches!(
            space.service.restore_bucket("nope").await,
            Err(Error::BucketNotFound(_))
        ));
    }
}
