//! Mirror hub and identity collaborators
//!
//! The hub owns the remote side of backups: it creates the thread and
//! bucket a mirror lives in and replicates a primary bucket's thread so the
//! backup can be resolved on its own.

use crate::bucket::client::{BucketClient, BucketRoot};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Remote hub that hosts mirror buckets
#[async_trait]
pub trait MirrorHub: Send + Sync {
    /// Create the thread a mirror bucket will live in; returns its db id
    async fn create_thread(&self, slug: &str) -> Result<String>;

    /// Create a private bucket inside `db_id`
    async fn create_bucket(&self, db_id: &str, name: &str) -> Result<BucketRoot>;

    /// Replicate a local thread to the hub
    async fn replicate_thread(&self, db_id: &str) -> Result<()>;

    /// Stop replicating a local thread
    async fn dereplicate_thread(&self, db_id: &str) -> Result<()>;

    /// Raw client for buckets hosted on the hub
    fn client(&self) -> Arc<dyn BucketClient>;
}

/// Source of the daemon's own identity
pub trait Keychain: Send + Sync {
    /// Public key the daemon is known by on the remote
    fn identity_public_key(&self) -> Result<String>;
}

/// Hub backed by any [`BucketClient`], tracking threads locally
pub struct LocalHub {
    client: Arc<dyn BucketClient>,
    /// Mirror threads created on the hub
    threads: Mutex<HashSet<String>>,
    /// Local threads currently replicated
    replicated: Mutex<HashSet<String>>,
}

impl LocalHub {
    pub fn new(client: Arc<dyn BucketClient>) -> Self {
        LocalHub {
            client,
            threads: Mutex::new(HashSet::new()),
            replicated: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_replicated(&self, db_id: &str) -> bool {
        self.replicated.lock().contains(db_id)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

#[async_trait]
impl MirrorHub for LocalHub {
    async fn create_thread(&self, slug: &str) -> Result<String> {
        let db_id = Uuid::new_v4().simple().to_string();
        self.threads.lock().insert(db_id.clone());
        debug!("Created mirror thread {} for {}", db_id, slug);
        Ok(db_id)
    }

    async fn create_bucket(&self, db_id: &str, name: &str) -> Result<BucketRoot> {
        if !self.threads.lock().contains(db_id) {
            return Err(Error::Remote(format!("thread {} not found", db_id)));
        }
        self.client.create(name).await
    }

    async fn replicate_thread(&self, db_id: &str) -> Result<()> {
        self.replicated.lock().insert(db_id.to_string());
        info!("Replicating thread {}", db_id);
        Ok(())
    }

    async fn dereplicate_thread(&self, db_id: &str) -> Result<()> {
        self.replicated.lock().remove(db_id);
        info!("Stopped replicating thread {}", db_id);
        Ok(())
    }

    fn client(&self) -> Arc<dyn BucketClient> {
        self.client.clone()
    }
}

/// Keychain holding a fixed identity
pub struct StaticKeychain {
    public_key: String,
}

impl StaticKeychain {
    pub fn new(public_key: impl Into<String>) -> Self {
        StaticKeychain {
            public_key: public_key.into(),
        }
    }
}

impl Keychain for StaticKeychain {
    fn identity_public_key(&self) -> Result<String> {
        if self.public_key.is_empty() {
            return Err(Error::Config("identity public key not set".to_string()));
        }
        Ok(self.public_key.clone())
    }
}
