//! Sled-based metadata store

use crate::error::{Error, Result};
use crate::metadata::{BucketRecord, MirrorBucketRecord, MirrorFile};
use parking_lot::RwLock;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// State key holding the serialized sync queue snapshot
pub const SYNC_QUEUE_KEY: &str = "SyncTaskQueue";

/// State key holding the persisted "mount on start" flag
pub const MOUNT_FLAG_KEY: &str = "mountFuseDrive";

/// Local metadata store using sled
#[derive(Clone)]
pub struct MetadataStore {
    /// Sled database
    db: Db,
    /// Bucket records keyed by slug
    buckets: Tree,
    /// Mirror file records keyed by `slug\0path`
    mirror_files: Tree,
    /// General daemon state
    state: Tree,
    /// In-memory bucket record cache
    cache: Arc<RwLock<HashMap<String, BucketRecord>>>,
}

impl MetadataStore {
    /// Open or create a metadata store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!(
            "Metadata store opened at {}, buckets: {}",
            path.as_ref().display(),
            store.buckets.len()
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(MetadataStore {
            buckets: db.open_tree("buckets")?,
            mirror_files: db.open_tree("mirror_files")?,
            state: db.open_tree("state")?,
            cache: Arc::new(RwLock::new(HashMap::new())),
            db,
        })
    }

    fn mirror_file_key(slug: &str, path: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(slug.len() + path.len() + 1);
        key.extend_from_slice(slug.as_bytes());
        key.push(0);
        key.extend_from_slice(path.as_bytes());
        key
    }

    /// Save (insert or replace) a bucket record
    pub fn save_bucket(&self, record: &BucketRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.buckets.insert(record.slug.as_bytes(), data)?;
        self.cache.write().insert(record.slug.clone(), record.clone());
        debug!("Saved bucket record {}", record.slug);
        Ok(())
    }

    /// Find a bucket record by slug
    pub fn find_bucket(&self, slug: &str) -> Result<Option<BucketRecord>> {
        if let Some(record) = self.cache.read().get(slug) {
            return Ok(Some(record.clone()));
        }

        match self.buckets.get(slug.as_bytes())? {
            Some(data) => {
                let record: BucketRecord = serde_json::from_slice(&data)?;
                self.cache.write().insert(slug.to_string(), record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Find a bucket record, failing if it does not exist
    pub fn get_bucket(&self, slug: &str) -> Result<BucketRecord> {
        self.find_bucket(slug)?
            .ok_or_else(|| Error::BucketNotFound(slug.to_string()))
    }

    /// List all bucket records
    pub fn list_buckets(&self) -> Result<Vec<BucketRecord>> {
        let mut records = Vec::new();
        for item in self.buckets.iter() {
            let (_, data) = item?;
            records.push(serde_json::from_slice(&data)?);
        }
        Ok(records)
    }

    /// Record the mirror created for a bucket
    pub fn set_mirror_bucket(&self, slug: &str, mirror: MirrorBucketRecord) -> Result<BucketRecord> {
        let mut record = self.get_bucket(slug)?;
        record.mirror = Some(mirror);
        self.save_bucket(&record)?;
        Ok(record)
    }

    /// Toggle the backup flag of a bucket
    pub fn set_bucket_backup(&self, slug: &str, backup: bool) -> Result<BucketRecord> {
        let mut record = self.get_bucket(slug)?;
        record.backup = backup;
        self.save_bucket(&record)?;
        Ok(record)
    }

    /// Find the mirror record of a file
    pub fn find_mirror_file(&self, slug: &str, path: &str) -> Result<Option<MirrorFile>> {
        match self.mirror_files.get(Self::mirror_file_key(slug, path))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the mirror record of a file
    pub fn save_mirror_file(&self, file: &MirrorFile) -> Result<()> {
        let data = serde_json::to_vec(file)?;
        self.mirror_files
            .insert(Self::mirror_file_key(&file.bucket_slug, &file.path), data)?;
        Ok(())
    }

    /// Save general daemon state
    pub fn save_state(&self, key: &str, value: &[u8]) -> Result<()> {
        self.state.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Get general daemon state
    pub fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;

    fn test_record(slug: &str) -> BucketRecord {
        BucketRecord::new(slug, "root-key", "db-1", EncryptionKey::generate())
    }

    #[test]
    fn test_save_and_find_bucket() {
        let store = MetadataStore::in_memory().unwrap();
        let record = test_record("personal");
        store.save_bucket(&record).unwrap();

        let found = store.find_bucket("personal").unwrap().unwrap();
        assert_eq!(found, record);
        assert!(store.find_bucket("missing").unwrap().is_none());
        assert!(matches!(store.get_bucket("missing"), Err(Error::BucketNotFound(_))));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = test_record("personal");
        {
            let store = MetadataStore::open(dir.path().join("db")).unwrap();
            store.save_bucket(&record).unwrap();
            store.save_state(MOUNT_FLAG_KEY, b"true").unwrap();
            store.flush().unwrap();
        }

        let store = MetadataStore::open(dir.path().join("db")).unwrap();
        assert_eq!(store.get_bucket("personal").unwrap(), record);
        assert_eq!(store.get_state(MOUNT_FLAG_KEY).unwrap().unwrap(), b"true");
        assert_eq!(store.list_buckets().unwrap().len(), 1);
    }

    #[test]
    fn test_mirror_and_backup_updates() {
        let store = MetadataStore::in_memory().unwrap();
        store.save_bucket(&test_record("personal")).unwrap();

        let mirror = MirrorBucketRecord {
            remote_db_id: "hub-db".to_string(),
            remote_key: "hub-key".to_string(),
            remote_slug: "personal_mirror".to_string(),
        };
        store.set_mirror_bucket("personal", mirror.clone()).unwrap();
        store.set_bucket_backup("personal", false).unwrap();

        let record = store.get_bucket("personal").unwrap();
        assert_eq!(record.mirror, Some(mirror));
        assert!(!record.backup);
    }

    #[test]
    fn test_mirror_files() {
        let store = MetadataStore::in_memory().unwrap();
        let file = MirrorFile {
            path: "docs/a.txt".to_string(),
            bucket_slug: "personal".to_string(),
            backup: false,
            backup_in_progress: true,
            shared: false,
        };
        store.save_mirror_file(&file).unwrap();

        assert_eq!(store.find_mirror_file("personal", "docs/a.txt").unwrap(), Some(file));
        assert!(store.find_mirror_file("other", "docs/a.txt").unwrap().is_none());
    }
}
