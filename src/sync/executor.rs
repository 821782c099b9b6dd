//! Task executors
//!
//! [`BucketTaskExecutor`] carries out synchronizer tasks against the
//! primary buckets, their mirrors on the hub and the local mirror-file
//! records. Follow-up work is scheduled through the notifier it is handed
//! rather than run inline.

use crate::bucket::{AccessRole, AccessRoles, Bucket, BucketRegistry, Keychain};
use crate::error::Result;
use crate::fs::{base_name, is_hidden_name};
use crate::metadata::{MirrorBucketRecord, MirrorFile};
use crate::sync::synchronizer::SyncNotifier;
use crate::sync::task::{Task, TaskKind};
use async_trait::async_trait;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs one task; an error leaves the task queued for retry
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, notifier: &SyncNotifier) -> Result<()>;
}

pub struct BucketTaskExecutor {
    registry: Arc<BucketRegistry>,
    keychain: Arc<dyn Keychain>,
    /// Files copied between buckets are staged here
    scratch_dir: PathBuf,
}

fn is_hidden_path(path: &str) -> bool {
    is_hidden_name(base_name(path))
}

impl BucketTaskExecutor {
    pub fn new(
        registry: Arc<BucketRegistry>,
        keychain: Arc<dyn Keychain>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        BucketTaskExecutor {
            registry,
            keychain,
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn add_item(&self, slug: &str, path: &str, notifier: &SyncNotifier) -> Result<()> {
        let metadata = self.registry.metadata();
        let record = metadata.get_bucket(slug)?;
        if record.backup && metadata.find_mirror_file(slug, path)?.is_none() {
            self.set_mirror_file_backup(slug, path, true)?;
        }
        notifier.enqueue(TaskKind::PinFile, &[slug, path]);
        Ok(())
    }

    async fn remove_item(&self, slug: &str, path: &str, notifier: &SyncNotifier) -> Result<()> {
        notifier.enqueue(TaskKind::UnpinFile, &[slug, path]);
        self.unset_mirror_file_backup(slug, path)?;
        self.delete_from_mirror(slug, path).await
    }

    async fn pin_file(&self, slug: &str, path: &str) -> Result<()> {
        let primary = self.registry.get_bucket(slug)?;
        let mirror = self.registry.get_mirror_bucket(slug)?;
        self.copy_file(&primary, &mirror, path).await?;

        if let Err(e) = self.add_identity_as_owner(&mirror, path).await {
            warn!("Could not set owner of {} in {}: {}", path, mirror.slug(), e);
        }
        self.set_mirror_file_backup(slug, path, false)
    }

    /// Create the `<slug>_mirror` bucket on the hub, then replicate the
    /// primary's thread so the backup resolves on its own
    async fn create_mirror(&self, slug: &str) -> Result<()> {
        let metadata = self.registry.metadata();
        let record = metadata.get_bucket(slug)?;
        let hub = self.registry.hub();

        if record.mirror.is_some() {
            debug!("Mirror for {} already exists", slug);
        } else {
            let mirror_slug = format!("{}_mirror", slug);
            let db_id = hub.create_thread(&mirror_slug).await?;
            let root = hub.create_bucket(&db_id, &mirror_slug).await?;
            metadata.set_mirror_bucket(
                slug,
                MirrorBucketRecord {
                    remote_db_id: db_id,
                    remote_key: root.key,
                    remote_slug: mirror_slug.clone(),
                },
            )?;
            info!("Created mirror bucket {} for {}", mirror_slug, slug);
        }

        hub.replicate_thread(&record.db_id).await
    }

    async fn backup_on(&self, slug: &str, notifier: &SyncNotifier) -> Result<()> {
        let record = self.registry.metadata().get_bucket(slug)?;
        self.registry.hub().replicate_thread(&record.db_id).await?;

        let bucket = self.registry.get_bucket(slug)?;
        let files = bucket.walk("").await?;
        for path in files.iter().filter(|p| !is_hidden_path(p)) {
            notifier.notify_item_added(slug, path);
        }
        info!("Backup on for {}: {} files scheduled", slug, files.len());
        Ok(())
    }

    async fn backup_off(&self, slug: &str, notifier: &SyncNotifier) -> Result<()> {
        let record = self.registry.metadata().get_bucket(slug)?;
        self.registry.hub().dereplicate_thread(&record.db_id).await?;

        let bucket = self.registry.get_bucket(slug)?;
        let files = bucket.walk("").await?;
        for path in files.iter().filter(|p| !is_hidden_path(p)) {
            notifier.notify_item_removed(slug, path);
        }
        info!("Backup off for {}: {} files scheduled for removal", slug, files.len());
        Ok(())
    }

    /// Schedule a restore of every mirror file missing or older locally
    async fn restore_bucket(&self, slug: &str, notifier: &SyncNotifier) -> Result<()> {
        let primary = self.registry.get_bucket(slug)?;
        let mirror = self.registry.get_mirror_bucket(slug)?;

        let mut scheduled = 0;
        for path in mirror.walk("").await? {
            if is_hidden_path(&path) {
                continue;
            }
            if primary.file_exists(&path).await? {
                let mirror_updated = mirror.updated_at(&path).await?;
                if let Ok(local_updated) = primary.updated_at(&path).await {
                    if local_updated >= mirror_updated {
                        debug!("Skipping restore of {}: local copy is current", path);
                        continue;
                    }
                }
            }
            notifier.notify_file_restore(slug, &path);
            scheduled += 1;
        }
        info!("Restore of {}: {} files scheduled", slug, scheduled);
        Ok(())
    }

    async fn restore_file(&self, slug: &str, path: &str) -> Result<()> {
        let primary = self.registry.get_bucket(slug)?;
        let mirror = self.registry.get_mirror_bucket(slug)?;
        self.copy_file(&mirror, &primary, path).await
    }

    /// Copy the plaintext of `path` from one bucket to another through a
    /// scratch file; each side encrypts with its own session
    async fn copy_file(&self, from: &Bucket, to: &Bucket, path: &str) -> Result<()> {
        debug!("Copying {} from {} to {}", path, from.slug(), to.slug());
        let mut staged = tempfile::tempfile_in(&self.scratch_dir)?;
        from.get_file(path, &mut staged).await?;
        staged.seek(SeekFrom::Start(0))?;
        to.upload_file(path, Box::new(staged)).await?;
        Ok(())
    }

    async fn delete_from_mirror(&self, slug: &str, path: &str) -> Result<()> {
        let mirror = self.registry.get_mirror_bucket(slug)?;
        match mirror.delete_dir_or_file(path).await {
            Err(e) if e.is_not_found() => {
                debug!("{} already gone from {}", path, mirror.slug());
                Ok(())
            }
            result => result,
        }
    }

    async fn add_identity_as_owner(&self, mirror: &Bucket, path: &str) -> Result<()> {
        let mut roles = AccessRoles::new();
        roles.insert(self.keychain.identity_public_key()?, AccessRole::Admin);
        mirror.set_access_roles(path, roles).await
    }

    /// Mark a file as backed up, or as being backed up when `in_progress`
    fn set_mirror_file_backup(&self, slug: &str, path: &str, in_progress: bool) -> Result<()> {
        let metadata = self.registry.metadata();
        let file = match metadata.find_mirror_file(slug, path)? {
            Some(mut file) => {
                file.backup = true;
                file.backup_in_progress = in_progress;
                file
            }
            None => MirrorFile {
                path: path.to_string(),
                bucket_slug: slug.to_string(),
                backup: !in_progress,
                backup_in_progress: in_progress,
                shared: false,
            },
        };
        metadata.save_mirror_file(&file)
    }

    /// Clear the backup flags; the record stays since the file may be shared
    fn unset_mirror_file_backup(&self, slug: &str, path: &str) -> Result<()> {
        let metadata = self.registry.metadata();
        let Some(mut file) = metadata.find_mirror_file(slug, path)? else {
            warn!("Mirror file {} in {} does not exist", path, slug);
            return Ok(());
        };
        file.backup = false;
        file.backup_in_progress = false;
        metadata.save_mirror_file(&file)
    }
}

#[async_trait]
impl TaskExecutor for BucketTaskExecutor {
    async fn execute(&self, task: &Task, notifier: &SyncNotifier) -> Result<()> {
        debug!("Executing {} {:?}", task.kind, task.args);
        let slug = task.arg(0)?;
        match task.kind {
            TaskKind::AddItem => self.add_item(slug, task.arg(1)?, notifier).await,
            TaskKind::RemoveItem => self.remove_item(slug, task.arg(1)?, notifier).await,
            TaskKind::PinFile => self.pin_file(slug, task.arg(1)?).await,
            TaskKind::UnpinFile => self.delete_from_mirror(slug, task.arg(1)?).await,
            TaskKind::CreateBucket => self.create_mirror(slug).await,
            TaskKind::BackupOn => self.backup_on(slug, notifier).await,
            TaskKind::BackupOff => self.backup_off(slug, notifier).await,
            TaskKind::RestoreBucket => self.restore_bucket(slug, notifier).await,
            TaskKind::RestoreFile => self.restore_file(slug, task.arg(1)?).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::space::tests::test_space;
    use crate::sync::TaskState;
    use std::io::Cursor;

    async fn add(space: &crate::space::tests::TestSpace, path: &str, content: &[u8]) {
        space
            .service
            .add_item_with_reader(path, Box::new(Cursor::new(content.to_vec())), "personal")
            .await
            .unwrap();
    }

    async fn mirror_files(space: &crate::space::tests::TestSpace) -> Vec<String> {
        let mirror = space.registry.get_mirror_bucket("personal").unwrap();
        let mut files: Vec<String> = mirror
            .walk("")
            .await
            .unwrap()
            .into_iter()
            .filter(|p| !is_hidden_path(p))
            .collect();
        files.sort();
        files
    }

    async fn read(bucket: &Bucket, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        bucket.get_file(path, &mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_create_bucket_creates_mirror_once() {
        let space = test_space().await;
        let notifier = space.sync.notifier();
        notifier.notify_bucket_created("personal");
        space.sync.sync_now().await;

        let record = space.registry.metadata().get_bucket("personal").unwrap();
        let mirror = record.mirror.unwrap();
        assert_eq!(mirror.remote_slug, "personal_mirror");
        assert_eq!(space.hub.thread_count(), 1);

        notifier.notify_bucket_created("personal");
        space.sync.sync_now().await;
        assert_eq!(space.hub.thread_count(), 1);
        assert!(space.sync.pending_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_create_bucket_replicates_thread() {
        let space = test_space().await;
        let record = space.service.create_bucket("work").await.unwrap();
        assert!(!space.hub.is_replicated(&record.db_id));

        space.sync.sync_now().await;
        assert!(space.sync.pending_tasks().is_empty());

        let record = space.registry.metadata().get_bucket("work").unwrap();
        assert_eq!(record.mirror.unwrap().remote_slug, "work_mirror");
        assert!(space.hub.is_replicated(&record.db_id));
    }

    #[tokio::test]
    async fn test_added_file_is_pinned_to_mirror() {
        let space = test_space().await;
        space.sync.notifier().notify_bucket_created("personal");
        add(&space, "docs/a.txt", b"hello mirror").await;

        space.sync.sync_now().await;
        assert!(space.sync.pending_tasks().is_empty());

        let mirror = space.registry.get_mirror_bucket("personal").unwrap();
        assert_eq!(read(&mirror, "docs/a.txt").await, b"hello mirror");
        let roles = mirror.get_access_roles("docs/a.txt").await.unwrap();
        assert_eq!(roles.get("test-identity"), Some(&AccessRole::Admin));

        let file = space
            .registry
            .metadata()
            .find_mirror_file("personal", "docs/a.txt")
            .unwrap()
            .unwrap();
        assert!(file.backup);
        assert!(!file.backup_in_progress);
    }

    #[tokio::test]
    async fn test_pin_without_mirror_is_retried() {
        let space = test_space().await;
        add(&space, "a.txt", b"a").await;

        space.sync.sync_now().await;
        let pending = space.sync.pending_tasks();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TaskKind::PinFile);
        assert_eq!(pending[0].state, TaskState::Failed);

        let file = space
            .registry
            .metadata()
            .find_mirror_file("personal", "a.txt")
            .unwrap()
            .unwrap();
        assert!(file.backup_in_progress);

        space.sync.notifier().notify_bucket_created("personal");
        space.sync.sync_now().await;
        assert!(space.sync.pending_tasks().is_empty());
        assert_eq!(mirror_files(&space).await, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_removed_file_is_unpinned() {
        let space = test_space().await;
        space.sync.notifier().notify_bucket_created("personal");
        add(&space, "a.txt", b"a").await;
        add(&space, "b.txt", b"b").await;
        space.sync.sync_now().await;

        space.service.remove_dir_or_file("a.txt", "personal").await.unwrap();
        space.sync.sync_now().await;

        assert!(space.sync.pending_tasks().is_empty());
        assert_eq!(mirror_files(&space).await, vec!["b.txt"]);
        let file = space
            .registry
            .metadata()
            .find_mirror_file("personal", "a.txt")
            .unwrap()
            .unwrap();
        assert!(!file.backup);
    }

    #[tokio::test]
    async fn test_backup_toggle() {
        let space = test_space().await;
        space.sync.notifier().notify_bucket_created("personal");
        add(&space, "a.txt", b"a").await;
        add(&space, "dir/b.txt", b"b").await;
        space.sync.sync_now().await;
        let db_id = space.registry.metadata().get_bucket("personal").unwrap().db_id;

        space.service.toggle_bucket_backup("personal", false).await.unwrap();
        space.sync.sync_now().await;
        space.sync.sync_now().await;
        assert!(!space.hub.is_replicated(&db_id));
        assert!(mirror_files(&space).await.is_empty());
        assert!(space.sync.pending_tasks().is_empty());

        space.service.toggle_bucket_backup("personal", true).await.unwrap();
        space.sync.sync_now().await;
        space.sync.sync_now().await;
        assert!(space.hub.is_replicated(&db_id));
        assert_eq!(mirror_files(&space).await, vec!["a.txt", "dir/b.txt"]);
    }

    #[tokio::test]
    async fn test_restore_brings_back_missing_files() {
        let space = test_space().await;
        space.sync.notifier().notify_bucket_created("personal");
        add(&space, "a.txt", b"alpha").await;
        add(&space, "b.txt", b"beta").await;
        space.sync.sync_now().await;

        let primary = space.registry.get_bucket("personal").unwrap();
        primary.delete_dir_or_file("b.txt").await.unwrap();
        assert!(!primary.file_exists("b.txt").await.unwrap());

        space.service.restore_bucket("personal").await.unwrap();
        space.sync.sync_now().await;

        assert!(space.sync.pending_tasks().is_empty());
        assert_eq!(read(&primary, "b.txt").await, b"beta");
        assert_eq!(read(&primary, "a.txt").await, b"alpha");
    }

    #[tokio::test]
    async fn test_malformed_task_is_rejected() {
        let space = test_space().await;
        let executor = BucketTaskExecutor::new(
            space.registry.clone(),
            Arc::new(crate::bucket::StaticKeychain::new("test-identity")),
            space.dir.path().join("scratch"),
        );
        let task = Task::new(TaskKind::PinFile, vec!["personal".to_string()]);
        let err = executor
            .execute(&task, &space.sync.notifier())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedTask(_)));
    }
}
