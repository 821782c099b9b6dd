//! Bucket encryption keys
//!
//! A bucket key is a single 80-byte blob laid out as:
//! - bytes 0..32: AES-256 key
//! - bytes 32..48: CTR initialization vector
//! - bytes 48..80: HMAC-SHA512 key

use crate::crypto::{AES_KEY_SIZE, HMAC_KEY_SIZE, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

/// Per-bucket encryption key
#[derive(Clone)]
pub struct EncryptionKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl EncryptionKey {
    /// Generate a fresh random key. Called once, when a bucket is created.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut());
        EncryptionKey { key }
    }

    /// Build a key from raw bytes, rejecting anything that is not exactly 80 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(EncryptionKey { key })
    }

    /// Parse a hex-encoded key
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| Error::Serialization(format!("bad key hex: {}", e)))?,
        );
        Self::from_slice(&bytes)
    }

    /// Hex encoding used when the key is stored in bucket metadata
    pub fn to_hex(&self) -> String {
        hex::encode(self.key.as_ref())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn aes_key(&self) -> &[u8] {
        &self.key[..AES_KEY_SIZE]
    }

    pub fn iv(&self) -> &[u8] {
        &self.key[AES_KEY_SIZE..AES_KEY_SIZE + IV_SIZE]
    }

    pub fn hmac_key(&self) -> &[u8] {
        &self.key[AES_KEY_SIZE + IV_SIZE..AES_KEY_SIZE + IV_SIZE + HMAC_KEY_SIZE]
    }
}

impl TryFrom<&[u8]> for EncryptionKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_slice(bytes)
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.key.as_ref().ct_eq(other.key.as_ref()).into()
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        EncryptionKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_lengths() {
        for len in [0usize, 1, 32, 48, 64, 79, 81, 128] {
            let bytes = vec![7u8; len];
            match EncryptionKey::from_slice(&bytes) {
                Err(Error::InvalidKeyLength { expected, got }) => {
                    assert_eq!(expected, 80);
                    assert_eq!(got, len);
                }
                other => panic!("expected InvalidKeyLength for {} bytes, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_layout() {
        let bytes: Vec<u8> = (0..80u8).collect();
        let key = EncryptionKey::from_slice(&bytes).unwrap();
        assert_eq!(key.aes_key(), &bytes[..32]);
        assert_eq!(key.iv(), &bytes[32..48]);
        assert_eq!(key.hmac_key(), &bytes[48..80]);
    }

    #[test]
    fn test_hex_and_serde_round_trip() {
        let key = EncryptionKey::generate();
        let parsed = EncryptionKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);

        let json = serde_json::to_string(&key).unwrap();
        let back: EncryptionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(EncryptionKey::generate(), EncryptionKey::generate());
    }

    #[test]
    fn test_debug_hides_material() {
        let key = EncryptionKey::generate();
        assert_eq!(format!("{:?}", key), "EncryptionKey(..)");
    }
}
