//! Bucket operations
//!
//! A [`Bucket`] pairs a session with a secure client and serializes writes
//! through a per-bucket reader/writer lock. Reads (listing, pulling,
//! existence checks) share the lock; pushes and removals take it
//! exclusively. Helpers that run under the lock never take it again.

use crate::bucket::client::{AccessRoles, BoxReader, ListPathResponse, PathItem, PushResult};
use crate::bucket::secure::SecureBucketClient;
use crate::bucket::session::BucketSession;
use crate::crypto::path::KEEP_FILE_NAME;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::io::{self, Write};
use tokio::sync::RwLock;
use tracing::debug;

/// A primary or mirror bucket
pub struct Bucket {
    session: BucketSession,
    client: SecureBucketClient,
    lock: RwLock<()>,
}

/// Join a bucket-relative directory and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

impl Bucket {
    pub fn new(session: BucketSession, client: SecureBucketClient) -> Self {
        Bucket {
            session,
            client,
            lock: RwLock::new(()),
        }
    }

    pub fn slug(&self) -> &str {
        &self.session.slug
    }

    /// Root key on the remote
    pub fn key(&self) -> &str {
        &self.session.root_key
    }

    pub fn session(&self) -> &BucketSession {
        &self.session
    }

    /// Create an empty directory by writing its hidden marker
    pub async fn create_directory(&self, path: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let marker = join_path(path, KEEP_FILE_NAME);
        debug!("Creating directory {} in {}", path, self.slug());
        self.client
            .push_path(&self.session, &marker, Box::new(io::empty()))
            .await?;
        Ok(())
    }

    /// True if `path` lists as a directory; a missing path is `false`, not an error
    pub async fn dir_exists(&self, path: &str) -> Result<bool> {
        let _guard = self.lock.read().await;
        match self.client.list_path(&self.session, path).await {
            Ok(listing) => Ok(listing.item.is_dir),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// True if `path` is a file
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let _guard = self.lock.read().await;
        match self.client.list_path(&self.session, path).await {
            Ok(listing) => Ok(!listing.item.is_dir),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List `path` with its direct children, hidden markers included
    pub async fn list_directory(&self, path: &str) -> Result<ListPathResponse> {
        let _guard = self.lock.read().await;
        self.client.list_path(&self.session, path).await
    }

    pub async fn upload_file(&self, path: &str, reader: BoxReader) -> Result<PushResult> {
        let _guard = self.lock.write().await;
        self.client.push_path(&self.session, path, reader).await
    }

    /// Write the plaintext of `path` into `writer`
    pub async fn get_file(&self, path: &str, writer: &mut (dyn Write + Send)) -> Result<()> {
        let _guard = self.lock.read().await;
        self.client.pull_path(&self.session, path, writer).await
    }

    pub async fn delete_dir_or_file(&self, path: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        self.client.remove_path(&self.session, path).await
    }

    /// Last modification time of `path`
    pub async fn updated_at(&self, path: &str) -> Result<DateTime<Utc>> {
        let _guard = self.lock.read().await;
        let listing = self.client.list_path(&self.session, path).await?;
        Ok(listing.item.updated_at)
    }

    /// All file paths at or below `path`, depth first
    pub async fn walk(&self, path: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read().await;
        let mut files = Vec::new();
        let mut pending = vec![path.trim_matches('/').to_string()];

        while let Some(dir) = pending.pop() {
            let listing = match self.client.list_path(&self.session, &dir).await {
                Ok(listing) => listing,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !listing.item.is_dir {
                files.push(dir);
                continue;
            }
            for child in listing.item.items {
                let child_path = join_path(&dir, &child.name);
                if child.is_dir {
                    pending.push(child_path);
                } else {
                    files.push(child_path);
                }
            }
        }

        Ok(files)
    }

    pub async fn set_access_roles(&self, path: &str, roles: AccessRoles) -> Result<()> {
        let _guard = self.lock.write().await;
        self.client.set_access_roles(&self.session, path, roles).await
    }

    pub async fn get_access_roles(&self, path: &str) -> Result<AccessRoles> {
        let _guard = self.lock.read().await;
        self.client.get_access_roles(&self.session, path).await
    }
}

/// Visible children of a listing: hidden markers and OS junk left out
pub fn visible_items(listing: &ListPathResponse) -> Vec<&PathItem> {
    listing
        .item
        .items
        .iter()
        .filter(|item| !crate::fs::is_hidden_name(&item.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::client::BucketClient;
    use crate::bucket::memory::MemoryBucketClient;
    use crate::config::ListingPolicy;
    use crate::crypto::{encode_path, EncryptionKey};
    use crate::error::Error;
    use std::io::Cursor;
    use std::sync::Arc;

    async fn new_bucket() -> (Arc<MemoryBucketClient>, Bucket, EncryptionKey) {
        let raw = Arc::new(MemoryBucketClient::new());
        let root = raw.create("personal").await.unwrap();
        let key = EncryptionKey::generate();
        let session = BucketSession::new("personal", root.key).with_encryption_key(key.clone());
        let client = SecureBucketClient::new(raw.clone(), ListingPolicy::default());
        (raw, Bucket::new(session, client), key)
    }

    #[tokio::test]
    async fn test_create_directory_scenario() {
        let (_raw, bucket, _key) = new_bucket().await;
        bucket.create_directory("docs").await.unwrap();

        assert!(bucket.dir_exists("docs").await.unwrap());
        assert!(!bucket.dir_exists("missing").await.unwrap());

        let listing = bucket.list_directory("docs").await.unwrap();
        assert_eq!(listing.item.items.len(), 1);
        assert_eq!(listing.item.items[0].name, KEEP_FILE_NAME);
        assert!(visible_items(&listing).is_empty());
    }

    #[tokio::test]
    async fn test_upload_and_get_file_scenario() {
        let (_raw, bucket, _key) = new_bucket().await;
        bucket.create_directory("docs").await.unwrap();
        bucket
            .upload_file("docs/report.txt", Box::new(Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();

        let listing = bucket.list_directory("docs").await.unwrap();
        let visible = visible_items(&listing);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "report.txt");
        assert_eq!(visible[0].size, 5);

        let mut out = Vec::new();
        bucket.get_file("docs/report.txt", &mut out).await.unwrap();
        assert_eq!(out, b"hello");

        assert!(bucket.file_exists("docs/report.txt").await.unwrap());
        assert!(!bucket.file_exists("docs").await.unwrap());
        assert!(!bucket.file_exists("docs/other.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_object_scenario() {
        let (raw, bucket, key) = new_bucket().await;
        bucket
            .upload_file("docs/report.txt", Box::new(Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();

        let stored = encode_path("docs/report.txt", &key).unwrap();
        raw.corrupt_object(bucket.key(), &stored, 0);

        let mut out = Vec::new();
        let err = bucket.get_file("docs/report.txt", &mut out).await.unwrap_err();
        assert!(matches!(err, Error::Decrypt));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_walk_and_delete() {
        let (_raw, bucket, _key) = new_bucket().await;
        for path in ["a.txt", "docs/b.txt", "docs/deep/c.txt"] {
            bucket
                .upload_file(path, Box::new(Cursor::new(path.as_bytes().to_vec())))
                .await
                .unwrap();
        }

        let mut files = bucket.walk("").await.unwrap();
        files.sort();
        assert_eq!(files, vec!["a.txt", "docs/b.txt", "docs/deep/c.txt"]);

        bucket.delete_dir_or_file("docs").await.unwrap();
        assert_eq!(bucket.walk("").await.unwrap(), vec!["a.txt"]);
        assert!(bucket.updated_at("a.txt").await.is_ok());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("/docs/", "a"), "docs/a");
    }
}
