//! Cryptography module for bucketfs
//!
//! Provides AES-256-CTR with an HMAC-SHA512 trailer for object content and
//! per-segment path encryption. Nothing leaves the local system unencrypted
//! except the reserved marker names.

mod keys;
pub mod path;
pub mod stream;

pub use keys::EncryptionKey;
pub use path::{decode_path, decode_segment, encode_path, encode_segment, is_reserved_name};
pub use stream::{decrypt, decrypt_to_vec, encrypt, DecryptedFile, EncryptReader};

/// Size of AES-256 key in bytes
pub const AES_KEY_SIZE: usize = 32;

/// Size of the CTR initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// Size of the HMAC-SHA512 key in bytes
pub const HMAC_KEY_SIZE: usize = 32;

/// Total size of a bucket encryption key
pub const KEY_SIZE: usize = AES_KEY_SIZE + IV_SIZE + HMAC_KEY_SIZE;

/// Size of the HMAC-SHA512 trailer appended to every ciphertext
pub const TAG_SIZE: usize = 64;

/// Ciphertext window read per step while decrypting
pub const DECRYPT_WINDOW: usize = 16 * 1024;
