//! Path codec
//!
//! Paths are encrypted one `/`-separated segment at a time so a listing only
//! has to decrypt the names it returns. Each segment is run through the
//! stream cipher and encoded as unpadded URL-safe base64. Empty segments
//! (leading, trailing and doubled slashes) are kept as-is so directory paths
//! keep their trailing slash.

use crate::crypto::{decrypt_to_vec, encrypt, EncryptionKey};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Hidden marker that keeps otherwise-empty directories alive on the remote
pub const KEEP_FILE_NAME: &str = ".keep";

/// Names that are stored verbatim and never encrypted
const RESERVED_NAMES: &[&str] = &[KEEP_FILE_NAME];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Encrypt a single path segment
pub fn encode_segment(segment: &str, key: &EncryptionKey) -> Result<String> {
    if segment.is_empty() || is_reserved_name(segment) {
        return Ok(segment.to_string());
    }
    let ciphertext = encrypt(segment.as_bytes(), key)?;
    Ok(URL_SAFE_NO_PAD.encode(ciphertext))
}

/// Decrypt a single path segment
pub fn decode_segment(segment: &str, key: &EncryptionKey) -> Result<String> {
    if segment.is_empty() || is_reserved_name(segment) {
        return Ok(segment.to_string());
    }
    let ciphertext = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| Error::Decrypt)?;
    let plaintext = decrypt_to_vec(&ciphertext, key)?;
    String::from_utf8(plaintext).map_err(|_| Error::Decrypt)
}

/// Encrypt every segment of `path`
pub fn encode_path(path: &str, key: &EncryptionKey) -> Result<String> {
    let segments = path
        .split('/')
        .map(|segment| encode_segment(segment, key))
        .collect::<Result<Vec<_>>>()?;
    Ok(segments.join("/"))
}

/// Decrypt every segment of an encoded path
pub fn decode_path(path: &str, key: &EncryptionKey) -> Result<String> {
    let segments = path
        .split('/')
        .map(|segment| decode_segment(segment, key))
        .collect::<Result<Vec<_>>>()?;
    Ok(segments.join("/"))
}
