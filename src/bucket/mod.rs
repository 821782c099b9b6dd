//! Remote bucket access
//!
//! Raw clients speak to the remote store in ciphertext. The secure client
//! encrypts names and content on the way out and decrypts on the way back;
//! [`Bucket`] adds per-bucket locking and directory helpers on top.

mod bucket;
mod client;
mod hub;
mod local;
mod memory;
mod pipe;
mod registry;
mod secure;
mod session;

pub use bucket::{join_path, visible_items, Bucket};
pub use client::{
    AccessRole, AccessRoles, BoxReader, BucketClient, BucketRoot, ListPathResponse, PathItem,
    PushResult,
};
pub use hub::{Keychain, LocalHub, MirrorHub, StaticKeychain};
pub use local::DirBucketClient;
pub use memory::MemoryBucketClient;
pub use pipe::{chunk_pipe, PipeReader, PipeWriter};
pub use registry::BucketRegistry;
pub use secure::SecureBucketClient;
pub use session::BucketSession;
