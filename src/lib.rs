//! bucketfs - Encrypted bucket-backed drive
//!
//! This library exposes remote object buckets as a FUSE drive. Names and
//! content are encrypted before they leave the machine, and a background
//! synchronizer keeps a mirror of every bucket that has backup enabled.

pub mod bucket;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod metadata;
pub mod space;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bucket::{Bucket, BucketClient, BucketRegistry};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::SpaceFs;
    pub use crate::space::SpaceService;
    pub use crate::sync::{SyncNotifier, Synchronizer};
}
