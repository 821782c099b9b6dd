//! Typed bucket session

use crate::crypto::EncryptionKey;
use crate::error::{Error, Result};

/// Everything a secure call needs to address one bucket: target identifiers
/// and the bucket's encryption key.
///
/// Sessions are built once per bucket and passed explicitly to every call;
/// nothing is looked up from shared state at call time.
#[derive(Debug, Clone)]
pub struct BucketSession {
    pub slug: String,
    /// Root key on the remote
    pub root_key: String,
    pub db_id: Option<String>,
    encryption_key: Option<EncryptionKey>,
}

impl BucketSession {
    pub fn new(slug: impl Into<String>, root_key: impl Into<String>) -> Self {
        BucketSession {
            slug: slug.into(),
            root_key: root_key.into(),
            db_id: None,
            encryption_key: None,
        }
    }

    pub fn with_db_id(mut self, db_id: impl Into<String>) -> Self {
        self.db_id = Some(db_id.into());
        self
    }

    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// The bucket key, or `MissingEncryptionKey` if the session was built without one
    pub fn encryption_key(&self) -> Result<&EncryptionKey> {
        self.encryption_key.as_ref().ok_or(Error::MissingEncryptionKey)
    }
}
