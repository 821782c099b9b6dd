//! In-memory remote bucket
//!
//! Behaves like the remote store as far as this crate cares: objects keyed
//! by path, directories implied by their contents, gateway-style item
//! paths, and "no link named" errors for missing paths. Used by tests and
//! as a scratch backend.

use crate::bucket::client::{
    AccessRoles, BoxReader, BucketClient, BucketRoot, ListPathResponse, PathItem, PushResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use tracing::debug;
use uuid::Uuid;

struct StoredObject {
    data: Bytes,
    cid: String,
    updated_at: DateTime<Utc>,
}

struct MemoryRoot {
    name: String,
    cid: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    objects: BTreeMap<String, StoredObject>,
    roles: HashMap<String, AccessRoles>,
}

impl MemoryRoot {
    fn gateway_path(&self, path: &str) -> String {
        if path.is_empty() {
            format!("/ipfs/{}", self.cid)
        } else {
            format!("/ipfs/{}/{}", self.cid, path)
        }
    }

    fn to_root(&self, key: &str) -> BucketRoot {
        BucketRoot {
            key: key.to_string(),
            name: self.name.clone(),
            path: self.gateway_path(""),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        let mut hasher = blake3::Hasher::new();
        for (path, object) in &self.objects {
            hasher.update(path.as_bytes());
            hasher.update(object.cid.as_bytes());
        }
        self.cid = content_id(hasher.finalize().as_bytes());
        self.updated_at = Utc::now();
    }

    fn missing(&self, path: &str) -> Error {
        let segment = path.rsplit('/').next().unwrap_or(path);
        Error::Remote(format!("no link named \"{}\" under {}", segment, self.cid))
    }

    fn file_item(&self, path: &str, object: &StoredObject) -> PathItem {
        PathItem {
            cid: object.cid.clone(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: self.gateway_path(path),
            size: object.data.len() as u64,
            is_dir: false,
            items: Vec::new(),
            updated_at: object.updated_at,
        }
    }

    /// Directory item with its direct children, or `None` if nothing lives below `path`
    fn dir_item(&self, path: &str) -> Option<PathItem> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let mut children: BTreeMap<String, PathItem> = BTreeMap::new();
        for (key, object) in self.objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => {
                    children.insert(rest.to_string(), self.file_item(key, object));
                }
                Some((dir, _)) => {
                    let child_path = format!("{}{}", prefix, dir);
                    let entry = children.entry(dir.to_string()).or_insert_with(|| PathItem {
                        cid: content_id(child_path.as_bytes()),
                        name: dir.to_string(),
                        path: self.gateway_path(&child_path),
                        size: 0,
                        is_dir: true,
                        items: Vec::new(),
                        updated_at: object.updated_at,
                    });
                    entry.size += object.data.len() as u64;
                    entry.updated_at = entry.updated_at.max(object.updated_at);
                }
            }
        }

        if children.is_empty() && !path.is_empty() {
            return None;
        }

        let items: Vec<PathItem> = children.into_values().collect();
        Some(PathItem {
            cid: if path.is_empty() {
                self.cid.clone()
            } else {
                content_id(path.as_bytes())
            },
            name: if path.is_empty() {
                self.cid.clone()
            } else {
                path.rsplit('/').next().unwrap_or(path).to_string()
            },
            path: self.gateway_path(path),
            size: items.iter().map(|i| i.size).sum(),
            is_dir: true,
            updated_at: items
                .iter()
                .map(|i| i.updated_at)
                .max()
                .unwrap_or(self.updated_at),
            items,
        })
    }
}

fn content_id(bytes: &[u8]) -> String {
    format!("bafy{}", &blake3::hash(bytes).to_hex()[..40])
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// In-memory implementation of [`BucketClient`]
#[derive(Default)]
pub struct MemoryBucketClient {
    roots: DashMap<String, MemoryRoot>,
}

impl MemoryBucketClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_root<T>(&self, root_key: &str, f: impl FnOnce(&MemoryRoot) -> Result<T>) -> Result<T> {
        let root = self
            .roots
            .get(root_key)
            .ok_or_else(|| Error::Remote(format!("could not resolve path: bucket {}", root_key)))?;
        f(&root)
    }

    fn with_root_mut<T>(
        &self,
        root_key: &str,
        f: impl FnOnce(&mut MemoryRoot) -> Result<T>,
    ) -> Result<T> {
        let mut root = self
            .roots
            .get_mut(root_key)
            .ok_or_else(|| Error::Remote(format!("could not resolve path: bucket {}", root_key)))?;
        f(&mut root)
    }

    /// Stored object paths of a root, as the remote sees them
    pub fn object_paths(&self, root_key: &str) -> Vec<String> {
        self.roots
            .get(root_key)
            .map(|root| root.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored bytes of an object, as the remote sees them
    pub fn raw_object(&self, root_key: &str, path: &str) -> Option<Vec<u8>> {
        self.roots
            .get(root_key)
            .and_then(|root| root.objects.get(normalize(path)).map(|o| o.data.to_vec()))
    }

    /// Flip one byte of a stored object out-of-band
    pub fn corrupt_object(&self, root_key: &str, path: &str, index: usize) {
        if let Some(mut root) = self.roots.get_mut(root_key) {
            if let Some(object) = root.objects.get_mut(normalize(path)) {
                let mut data = object.data.to_vec();
                if let Some(byte) = data.get_mut(index) {
                    *byte ^= 0xff;
                }
                object.data = Bytes::from(data);
            }
        }
    }
}

#[async_trait]
impl BucketClient for MemoryBucketClient {
    async fn create(&self, name: &str) -> Result<BucketRoot> {
        let key = Uuid::new_v4().to_string();
        let now = Utc::now();
        let root = MemoryRoot {
            name: name.to_string(),
            cid: content_id(key.as_bytes()),
            created_at: now,
            updated_at: now,
            objects: BTreeMap::new(),
            roles: HashMap::new(),
        };
        let bucket_root = root.to_root(&key);
        self.roots.insert(key, root);
        debug!("Created memory bucket {}", name);
        Ok(bucket_root)
    }

    async fn push_path(&self, root_key: &str, path: &str, mut reader: BoxReader) -> Result<PushResult> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        self.with_root_mut(root_key, |root| {
            let path = normalize(path);
            if path.is_empty() {
                return Err(Error::Remote("cannot push to the bucket root".to_string()));
            }
            let object = StoredObject {
                cid: content_id(&data),
                data: Bytes::from(data),
                updated_at: Utc::now(),
            };
            root.objects.insert(path.to_string(), object);
            root.touch();
            Ok(PushResult {
                path: root.gateway_path(path),
                root: root.gateway_path(""),
            })
        })
    }

    async fn pull_path(&self, root_key: &str, path: &str, writer: &mut (dyn Write + Send)) -> Result<()> {
        let data = self.with_root(root_key, |root| {
            let path = normalize(path);
            root.objects
                .get(path)
                .map(|o| o.data.clone())
                .ok_or_else(|| root.missing(path))
        })?;
        writer.write_all(&data)?;
        Ok(())
    }

    async fn list_path(&self, root_key: &str, path: &str) -> Result<ListPathResponse> {
        self.with_root(root_key, |root| {
            let path = normalize(path);
            let item = match root.objects.get(path) {
                Some(object) => root.file_item(path, object),
                None => root.dir_item(path).ok_or_else(|| root.missing(path))?,
            };
            Ok(ListPathResponse {
                item,
                root: Some(root.to_root(root_key)),
            })
        })
    }

    async fn remove_path(&self, root_key: &str, path: &str) -> Result<()> {
        self.with_root_mut(root_key, |root| {
            let path = normalize(path);
            let prefix = format!("{}/", path);
            let before = root.objects.len();
            root.objects
                .retain(|key, _| key != path && !key.starts_with(&prefix));
            root.roles
                .retain(|key, _| key != path && !key.starts_with(&prefix));
            if root.objects.len() == before {
                return Err(root.missing(path));
            }
            root.touch();
            Ok(())
        })
    }

    async fn push_access_roles(&self, root_key: &str, path: &str, roles: AccessRoles) -> Result<()> {
        self.with_root_mut(root_key, |root| {
            root.roles
                .entry(normalize(path).to_string())
                .or_default()
                .extend(roles);
            Ok(())
        })
    }

    async fn pull_access_roles(&self, root_key: &str, path: &str) -> Result<AccessRoles> {
        self.with_root(root_key, |root| {
            Ok(root.roles.get(normalize(path)).cloned().unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: &[u8]) -> BoxReader {
        Box::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_directories_are_implied() {
        let client = MemoryBucketClient::new();
        let root = client.create("b").await.unwrap();
        client.push_path(&root.key, "a/b/c.txt", reader(b"abc")).await.unwrap();
        client.push_path(&root.key, "a/d.txt", reader(b"d")).await.unwrap();

        let listing = client.list_path(&root.key, "a").await.unwrap();
        assert!(listing.item.is_dir);
        let names: Vec<_> = listing.item.items.iter().map(|i| (i.name.as_str(), i.is_dir)).collect();
        assert_eq!(names, vec![("b", true), ("d.txt", false)]);
        assert!(listing.item.items[0].path.ends_with("/a/b"));

        let root_listing = client.list_path(&root.key, "").await.unwrap();
        assert_eq!(root_listing.item.items.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_paths_use_remote_wording() {
        let client = MemoryBucketClient::new();
        let root = client.create("b").await.unwrap();
        let err = client.list_path(&root.key, "nope").await.unwrap_err();
        assert!(err.to_string().contains("no link named \"nope\" under"));
        assert!(err.is_not_found());

        let mut out = Vec::new();
        assert!(client
            .pull_path(&root.key, "nope", &mut out)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(client.remove_path(&root.key, "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_directory_recursively() {
        let client = MemoryBucketClient::new();
        let root = client.create("b").await.unwrap();
        client.push_path(&root.key, "a/b/c.txt", reader(b"abc")).await.unwrap();
        client.push_path(&root.key, "ab.txt", reader(b"x")).await.unwrap();

        client.remove_path(&root.key, "a").await.unwrap();
        assert_eq!(client.object_paths(&root.key), vec!["ab.txt".to_string()]);
    }
}
