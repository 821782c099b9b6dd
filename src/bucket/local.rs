//! Directory-backed remote bucket
//!
//! Stores each bucket root as a directory tree under a base path. Used by
//! the CLI for standalone drives; objects on disk are exactly what a remote
//! would hold (encrypted names, encrypted bodies).
//!
//! Each path segment becomes one file name, so segments are limited to
//! [`MAX_SEGMENT_LEN`] bytes. An encrypted name carries the 64-byte tag and
//! is base64 encoded, which caps plaintext names at 127 bytes. Longer names
//! fail with a `name too long` remote error.

use crate::bucket::client::{
    AccessRoles, BoxReader, BucketClient, BucketRoot, ListPathResponse, PathItem, PushResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Longest file name most local filesystems accept
pub const MAX_SEGMENT_LEN: usize = 255;

#[derive(Serialize, Deserialize)]
struct RootInfo {
    name: String,
    created_at: DateTime<Utc>,
}

/// [`BucketClient`] storing objects as files under `base`
pub struct DirBucketClient {
    base: PathBuf,
    /// Serializes access-role file updates
    roles_lock: Mutex<()>,
}

impl DirBucketClient {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join("roots"))?;
        fs::create_dir_all(base.join("roles"))?;
        Ok(DirBucketClient {
            base,
            roles_lock: Mutex::new(()),
        })
    }

    fn root_dir(&self, root_key: &str) -> Result<PathBuf> {
        if root_key.is_empty() || root_key.contains(['/', '\\', '.']) {
            return Err(Error::Remote(format!("invalid bucket key {}", root_key)));
        }
        let dir = self.base.join("roots").join(root_key);
        if !dir.is_dir() {
            return Err(Error::Remote(format!(
                "could not resolve path: bucket {}",
                root_key
            )));
        }
        Ok(dir)
    }

    fn root_info(&self, root_key: &str) -> Result<RootInfo> {
        let data = fs::read(self.base.join("roots").join(format!("{}.json", root_key)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Resolve a bucket path to a location on disk, refusing `..` escapes
    fn object_path(&self, root_key: &str, path: &str) -> Result<(PathBuf, String)> {
        let root = self.root_dir(root_key)?;
        let path = path.trim_matches('/');
        let mut resolved = root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(Error::Remote(format!("invalid path segment {}", segment)));
            }
            if segment.len() > MAX_SEGMENT_LEN {
                return Err(Error::Remote(format!(
                    "name too long for the local store: {} bytes, limit {}",
                    segment.len(),
                    MAX_SEGMENT_LEN
                )));
            }
            resolved.push(segment);
        }
        Ok((resolved, path.to_string()))
    }

    fn missing(root_key: &str, path: &str) -> Error {
        let segment = path.rsplit('/').next().unwrap_or(path);
        Error::Remote(format!("no link named \"{}\" under {}", segment, root_key))
    }

    fn gateway_path(root_key: &str, path: &str) -> String {
        if path.is_empty() {
            format!("/ipfs/{}", root_key)
        } else {
            format!("/ipfs/{}/{}", root_key, path)
        }
    }

    fn item_for(root_key: &str, location: &Path, path: &str) -> Result<PathItem> {
        let meta = fs::metadata(location)?;
        let updated_at: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_bytes());
        hasher.update(&meta.len().to_le_bytes());
        hasher.update(updated_at.to_rfc3339().as_bytes());

        Ok(PathItem {
            cid: format!("bafy{}", &hasher.finalize().to_hex()[..40]),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: Self::gateway_path(root_key, path),
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
            items: Vec::new(),
            updated_at,
        })
    }

    fn roles_file(&self, root_key: &str) -> PathBuf {
        self.base.join("roles").join(format!("{}.json", root_key))
    }

    fn read_roles(&self, root_key: &str) -> Result<HashMap<String, AccessRoles>> {
        match fs::read(self.roles_file(root_key)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BucketClient for DirBucketClient {
    async fn create(&self, name: &str) -> Result<BucketRoot> {
        let key = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(self.base.join("roots").join(&key))?;
        let info = RootInfo {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        fs::write(
            self.base.join("roots").join(format!("{}.json", key)),
            serde_json::to_vec(&info)?,
        )?;
        debug!("Created local bucket {} at {}", name, key);

        Ok(BucketRoot {
            path: Self::gateway_path(&key, ""),
            key,
            name: info.name,
            created_at: info.created_at,
            updated_at: info.created_at,
        })
    }

    async fn push_path(&self, root_key: &str, path: &str, mut reader: BoxReader) -> Result<PushResult> {
        let (location, path) = self.object_path(root_key, path)?;
        let parent = match location.parent() {
            Some(parent) if !path.is_empty() => parent,
            _ => return Err(Error::Remote("cannot push to the bucket root".to_string())),
        };
        fs::create_dir_all(parent)?;

        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        io::copy(&mut reader, &mut staged)?;
        staged.flush()?;
        staged
            .persist(&location)
            .map_err(|e| Error::Io(e.error))?;

        Ok(PushResult {
            path: Self::gateway_path(root_key, &path),
            root: Self::gateway_path(root_key, ""),
        })
    }

    async fn pull_path(&self, root_key: &str, path: &str, writer: &mut (dyn Write + Send)) -> Result<()> {
        let (location, path) = self.object_path(root_key, path)?;
        let mut file = match fs::File::open(&location) {
            Ok(file) if location.is_file() => file,
            Ok(_) => return Err(Error::Remote(format!("{} is a directory", path))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Self::missing(root_key, &path))
            }
            Err(e) => return Err(e.into()),
        };
        io::copy(&mut file, writer)?;
        Ok(())
    }

    async fn list_path(&self, root_key: &str, path: &str) -> Result<ListPathResponse> {
        let (location, path) = self.object_path(root_key, path)?;
        if !location.exists() {
            return Err(Self::missing(root_key, &path));
        }

        let mut item = Self::item_for(root_key, &location, &path)?;
        if item.is_dir {
            let mut children = Vec::new();
            for entry in fs::read_dir(&location)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(".tmp") {
                    continue;
                }
                let child_path = if path.is_empty() {
                    name
                } else {
                    format!("{}/{}", path, name)
                };
                children.push(Self::item_for(root_key, &entry.path(), &child_path)?);
            }
            children.sort_by(|a, b| a.name.cmp(&b.name));
            item.size = children.iter().map(|c| c.size).sum();
            item.items = children;
        }

        let info = self.root_info(root_key)?;
        Ok(ListPathResponse {
            item,
            root: Some(BucketRoot {
                key: root_key.to_string(),
                name: info.name,
                path: Self::gateway_path(root_key, ""),
                created_at: info.created_at,
                updated_at: Utc::now(),
            }),
        })
    }

    async fn remove_path(&self, root_key: &str, path: &str) -> Result<()> {
        let (location, path) = self.object_path(root_key, path)?;
        if path.is_empty() {
            return Err(Error::Remote("cannot remove the bucket root".to_string()));
        }
        match fs::symlink_metadata(&location) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&location)?,
            Ok(_) => fs::remove_file(&location)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Self::missing(root_key, &path))
            }
            Err(e) => return Err(e.into()),
        }

        // Directories only exist while something lives below them
        let root = self.root_dir(root_key)?;
        let mut parent = location.parent();
        while let Some(dir) = parent {
            if dir == root || fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
        Ok(())
    }

    async fn push_access_roles(&self, root_key: &str, path: &str, roles: AccessRoles) -> Result<()> {
        let (_, path) = self.object_path(root_key, path)?;
        let _guard = self.roles_lock.lock();
        let mut all = self.read_roles(root_key)?;
        all.entry(path).or_default().extend(roles);
        fs::write(self.roles_file(root_key), serde_json::to_vec(&all)?)?;
        Ok(())
    }

    async fn pull_access_roles(&self, root_key: &str, path: &str) -> Result<AccessRoles> {
        let (_, path) = self.object_path(root_key, path)?;
        let _guard = self.roles_lock.lock();
        Ok(self.read_roles(root_key)?.remove(&path).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_push_list_pull_remove() {
        let dir = tempfile::tempdir().unwrap();
        let client = DirBucketClient::open(dir.path()).unwrap();
        let root = client.create("personal").await.unwrap();

        client
            .push_path(&root.key, "docs/a.txt", Box::new(Cursor::new(b"abc".to_vec())))
            .await
            .unwrap();

        let listing = client.list_path(&root.key, "docs").await.unwrap();
        assert!(listing.item.is_dir);
        assert_eq!(listing.item.items.len(), 1);
        assert_eq!(listing.item.items[0].name, "a.txt");
        assert_eq!(listing.item.items[0].size, 3);
        assert!(listing.item.items[0].path.ends_with("/docs/a.txt"));

        let mut out = Vec::new();
        client.pull_path(&root.key, "docs/a.txt", &mut out).await.unwrap();
        assert_eq!(out, b"abc");

        client.remove_path(&root.key, "docs").await.unwrap();
        assert!(client.list_path(&root.key, "docs").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let client = DirBucketClient::open(dir.path()).unwrap();
        let root = client.create("personal").await.unwrap();
        assert!(client.list_path(&root.key, "../..").await.is_err());
        assert!(client.list_path("../roles", "").await.is_err());
    }

    #[tokio::test]
    async fn test_overlong_segment_is_a_clear_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = DirBucketClient::open(dir.path()).unwrap();
        let root = client.create("personal").await.unwrap();

        let name = "x".repeat(MAX_SEGMENT_LEN + 1);
        let err = client
            .push_path(&root.key, &format!("docs/{}", name), Box::new(Cursor::new(b"abc".to_vec())))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg.contains("name too long")));
        assert!(!err.is_not_found());

        // Right at the limit is still fine
        let name = "y".repeat(MAX_SEGMENT_LEN);
        client
            .push_path(&root.key, &name, Box::new(Cursor::new(b"abc".to_vec())))
            .await
            .unwrap();
        let mut out = Vec::new();
        client.pull_path(&root.key, &name, &mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }
}
