//! Raw remote bucket contract
//!
//! Everything the rest of the crate knows about the remote store goes
//! through [`BucketClient`]: push, pull, list and remove by path under a
//! root key, plus per-path access roles. Implementations see only
//! ciphertext; encryption happens in [`crate::bucket::SecureBucketClient`].

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Plaintext or ciphertext source handed to a push
pub type BoxReader = Box<dyn Read + Send>;

/// A bucket root on the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRoot {
    pub key: String,
    pub name: String,
    /// Gateway path of the root, e.g. `/ipfs/<cid>`
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in a path listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathItem {
    pub cid: String,
    pub name: String,
    /// Gateway path, e.g. `/ipfs/<root cid>/<path>`
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub items: Vec<PathItem>,
    pub updated_at: DateTime<Utc>,
}

/// Response of a list call: the listed item with its direct children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPathResponse {
    pub item: PathItem,
    pub root: Option<BucketRoot>,
}

/// Response of a push call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// Gateway path of the pushed object
    pub path: String,
    /// Gateway path of the new root
    pub root: String,
}

/// Access level granted to an identity on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessRole {
    None,
    Reader,
    Writer,
    Admin,
}

/// Identity public key to role
pub type AccessRoles = HashMap<String, AccessRole>;

/// Remote bucket client working in terms of opaque paths and bytes
#[async_trait]
pub trait BucketClient: Send + Sync {
    /// Create a new bucket root
    async fn create(&self, name: &str) -> Result<BucketRoot>;

    /// Store the reader's content at `path`, replacing any previous object
    async fn push_path(&self, root_key: &str, path: &str, reader: BoxReader) -> Result<PushResult>;

    /// Write the object stored at `path` into `writer`
    async fn pull_path(&self, root_key: &str, path: &str, writer: &mut (dyn Write + Send)) -> Result<()>;

    /// List `path` and its direct children
    async fn list_path(&self, root_key: &str, path: &str) -> Result<ListPathResponse>;

    /// Remove a file, or a directory and everything below it
    async fn remove_path(&self, root_key: &str, path: &str) -> Result<()>;

    async fn push_access_roles(&self, root_key: &str, path: &str, roles: AccessRoles) -> Result<()>;

    async fn pull_access_roles(&self, root_key: &str, path: &str) -> Result<AccessRoles>;
}
