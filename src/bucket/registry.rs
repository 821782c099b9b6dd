//! Bucket registry
//!
//! Opens primary and mirror buckets by slug from the metadata store and
//! creates new buckets with a freshly generated key.

use crate::bucket::bucket::Bucket;
use crate::bucket::client::BucketClient;
use crate::bucket::hub::MirrorHub;
use crate::bucket::secure::SecureBucketClient;
use crate::bucket::session::BucketSession;
use crate::config::ListingPolicy;
use crate::crypto::EncryptionKey;
use crate::error::{Error, Result};
use crate::metadata::{BucketRecord, MetadataStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Open buckets keyed by slug
pub struct BucketRegistry {
    client: SecureBucketClient,
    mirror_client: SecureBucketClient,
    hub: Arc<dyn MirrorHub>,
    metadata: MetadataStore,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    mirrors: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl BucketRegistry {
    pub fn new(
        client: Arc<dyn BucketClient>,
        hub: Arc<dyn MirrorHub>,
        metadata: MetadataStore,
        policy: ListingPolicy,
    ) -> Self {
        BucketRegistry {
            client: SecureBucketClient::new(client, policy),
            mirror_client: SecureBucketClient::new(hub.client(), policy),
            hub,
            metadata,
            buckets: RwLock::new(HashMap::new()),
            mirrors: RwLock::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn hub(&self) -> &Arc<dyn MirrorHub> {
        &self.hub
    }

    /// Create a bucket on the remote with a new key and record it locally.
    ///
    /// Returns the existing bucket if `slug` is already known.
    pub async fn create_bucket(&self, slug: &str) -> Result<Arc<Bucket>> {
        if self.metadata.find_bucket(slug)?.is_some() {
            return self.get_bucket(slug);
        }

        let root = self.client.raw().create(slug).await?;
        let db_id = Uuid::new_v4().simple().to_string();
        let record = BucketRecord::new(slug, &root.key, &db_id, EncryptionKey::generate());
        self.metadata.save_bucket(&record)?;
        info!("Created bucket {} (root {})", slug, root.key);

        self.get_bucket(slug)
    }

    /// Open a known bucket
    pub fn get_bucket(&self, slug: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(slug) {
            return Ok(bucket.clone());
        }

        let record = self.metadata.get_bucket(slug)?;
        let session = BucketSession::new(&record.slug, &record.remote_key)
            .with_db_id(&record.db_id)
            .with_encryption_key(record.encryption_key);
        let bucket = Arc::new(Bucket::new(session, self.client.clone()));

        Ok(self
            .buckets
            .write()
            .entry(slug.to_string())
            .or_insert(bucket)
            .clone())
    }

    /// Open the mirror of a bucket; fails until the mirror has been created
    pub fn get_mirror_bucket(&self, slug: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.mirrors.read().get(slug) {
            return Ok(bucket.clone());
        }

        let record = self.metadata.get_bucket(slug)?;
        let mirror = record
            .mirror
            .ok_or_else(|| Error::MirrorNotConfigured(slug.to_string()))?;
        let session = BucketSession::new(&mirror.remote_slug, &mirror.remote_key)
            .with_db_id(&mirror.remote_db_id)
            .with_encryption_key(record.encryption_key);
        let bucket = Arc::new(Bucket::new(session, self.mirror_client.clone()));

        Ok(self
            .mirrors
            .write()
            .entry(slug.to_string())
            .or_insert(bucket)
            .clone())
    }

    pub fn list_buckets(&self) -> Result<Vec<BucketRecord>> {
        self.metadata.list_buckets()
    }
}
