//! Error types for bucketfs

use regex::Regex;
use std::io;
use std::sync::LazyLock;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Responses the remote bucket gives for a path that does not exist.
static REMOTE_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"no link named .*under|could not resolve path").expect("not-found pattern")
});

/// Main error type for bucketfs
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    /// Wrong key, or ciphertext that was corrupted or tampered with.
    #[error("Decryption failed: authentication tag mismatch or malformed ciphertext")]
    Decrypt,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Bucket session carries no encryption key")]
    MissingEncryptionKey,

    // Remote bucket errors
    #[error("Remote bucket error: {0}")]
    Remote(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Mirror bucket not configured for {0}")]
    MirrorNotConfigured(String),

    // Filesystem errors
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Invalid file handle: {0}")]
    InvalidFileHandle(u64),

    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    // Mount errors
    #[error("No free mount path near {0}")]
    MountPathUnavailable(String),

    #[error("Drive is already mounted")]
    AlreadyMounted,

    #[error("Drive is not mounted")]
    NotMounted,

    // Sync errors
    #[error("Task {0} exceeded its retry limit")]
    MaxRetriesExceeded(String),

    #[error("Unexpected task: {0}")]
    UnexpectedTask(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means "this path does not exist", either locally
    /// or as reported by the remote bucket.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::InodeNotFound(_) => true,
            Error::Remote(msg) => REMOTE_NOT_FOUND.is_match(msg),
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        if self.is_not_found() {
            return libc::ENOENT;
        }
        match self {
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::PermissionDenied => libc::EACCES,
            Error::InvalidFileHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", e))
    }
}
