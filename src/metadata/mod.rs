//! Metadata storage module
//!
//! Local, sled-backed records for buckets, their mirrors and per-file backup
//! state, plus a small key/value area for daemon state such as the sync
//! queue snapshot and the mount flag.

mod store;

pub use store::{MetadataStore, MOUNT_FLAG_KEY, SYNC_QUEUE_KEY};

use crate::crypto::EncryptionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local record of a primary bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketRecord {
    pub slug: String,
    /// Root key of the bucket on the remote
    pub remote_key: String,
    /// Thread/db the bucket lives in
    pub db_id: String,
    pub encryption_key: EncryptionKey,
    /// Whether content should be mirrored for backup
    pub backup: bool,
    pub mirror: Option<MirrorBucketRecord>,
    pub created_at: DateTime<Utc>,
}

impl BucketRecord {
    pub fn new(slug: &str, remote_key: &str, db_id: &str, encryption_key: EncryptionKey) -> Self {
        BucketRecord {
            slug: slug.to_string(),
            remote_key: remote_key.to_string(),
            db_id: db_id.to_string(),
            encryption_key,
            backup: true,
            mirror: None,
            created_at: Utc::now(),
        }
    }
}

/// Link from a primary bucket to its backup mirror
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorBucketRecord {
    pub remote_db_id: String,
    pub remote_key: String,
    pub remote_slug: String,
}

/// Backup state of a single file in the mirror
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorFile {
    pub path: String,
    pub bucket_slug: String,
    pub backup: bool,
    pub backup_in_progress: bool,
    pub shared: bool,
}
