//! Authenticated stream cipher
//!
//! Content is encrypted with AES-256-CTR and the ciphertext is authenticated
//! with HMAC-SHA512. The 64-byte tag is appended after the last ciphertext
//! byte, so encryption is a single streaming pass and decryption has to hold
//! back the final 64 bytes until end of stream.

use crate::crypto::{EncryptionKey, DECRYPT_WINDOW, TAG_SIZE};
use crate::error::{Error, Result};
use aes::cipher::{KeyIvInit, StreamCipher};
use ring::hmac;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use subtle::ConstantTimeEq;
use tracing::debug;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

fn new_cipher(key: &EncryptionKey) -> Result<Aes256Ctr> {
    Aes256Ctr::new_from_slices(key.aes_key(), key.iv())
        .map_err(|e| Error::Internal(format!("AES-CTR init: {}", e)))
}

fn new_mac(key: &EncryptionKey) -> hmac::Context {
    let mac_key = hmac::Key::new(hmac::HMAC_SHA512, key.hmac_key());
    hmac::Context::with_key(&mac_key)
}

/// Streaming encryptor: wraps a plaintext reader and yields ciphertext
/// followed by the HMAC trailer.
pub struct EncryptReader<R> {
    inner: R,
    cipher: Aes256Ctr,
    mac: Option<hmac::Context>,
    tag: Option<hmac::Tag>,
    tag_pos: usize,
}

impl<R: Read> EncryptReader<R> {
    pub fn new(inner: R, key: &EncryptionKey) -> Result<Self> {
        Ok(EncryptReader {
            inner,
            cipher: new_cipher(key)?,
            mac: Some(new_mac(key)),
            tag: None,
            tag_pos: 0,
        })
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(mac) = self.mac.as_mut() {
            let n = self.inner.read(buf)?;
            if n > 0 {
                self.cipher.apply_keystream(&mut buf[..n]);
                mac.update(&buf[..n]);
                return Ok(n);
            }
        }

        // Source exhausted: seal once, then drain the trailer.
        if let Some(mac) = self.mac.take() {
            self.tag = Some(mac.sign());
        }

        match &self.tag {
            Some(tag) => {
                let remaining = &tag.as_ref()[self.tag_pos..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.tag_pos += n;
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

/// Encrypt a complete buffer. Output is `plaintext.len() + 64` bytes.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut reader = EncryptReader::new(plaintext, key)?;
    let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Verified plaintext backed by an anonymous scratch file.
///
/// The file is unlinked at creation, so dropping this value releases the
/// last reference and the space is reclaimed.
#[derive(Debug)]
pub struct DecryptedFile {
    file: File,
    len: u64,
}

impl DecryptedFile {
    /// Plaintext length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl Read for DecryptedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for DecryptedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Decrypt a ciphertext stream into a scratch file.
///
/// Plaintext is only handed back after the trailer has been verified; any
/// mismatch (wrong key, flipped bit, truncation) yields `Error::Decrypt` and
/// the scratch file is discarded.
pub fn decrypt<R: Read>(mut reader: R, key: &EncryptionKey) -> Result<DecryptedFile> {
    let mut cipher = new_cipher(key)?;
    let mut mac = new_mac(key);
    let mut scratch = tempfile::tempfile()?;

    let mut window = vec![0u8; DECRYPT_WINDOW];
    let mut pending: Vec<u8> = Vec::with_capacity(DECRYPT_WINDOW + TAG_SIZE);
    let mut written: u64 = 0;

    loop {
        let n = match reader.read(&mut window) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        pending.extend_from_slice(&window[..n]);

        // Everything except the last TAG_SIZE bytes is known to be ciphertext.
        if pending.len() > TAG_SIZE {
            let ready = pending.len() - TAG_SIZE;
            mac.update(&pending[..ready]);
            cipher.apply_keystream(&mut pending[..ready]);
            scratch.write_all(&pending[..ready])?;
            written += ready as u64;
            pending.drain(..ready);
        }
    }

    if pending.len() < TAG_SIZE {
        debug!("ciphertext shorter than tag: {} bytes", written as usize + pending.len());
        return Err(Error::Decrypt);
    }

    let computed = mac.sign();
    if !bool::from(computed.as_ref().ct_eq(&pending[..])) {
        return Err(Error::Decrypt);
    }

    scratch.flush()?;
    scratch.seek(SeekFrom::Start(0))?;

    Ok(DecryptedFile {
        file: scratch,
        len: written,
    })
}

/// Decrypt a small in-memory ciphertext such as an encrypted path segment.
pub fn decrypt_to_vec(ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Decrypt);
    }
    let (body, tag) = ciphertext.split_at(ciphertext.len() - TAG_SIZE);

    let mut mac = new_mac(key);
    mac.update(body);
    if !bool::from(mac.sign().as_ref().ct_eq(tag)) {
        return Err(Error::Decrypt);
    }

    let mut plaintext = body.to_vec();
    new_cipher(key)?.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn decrypt_all(ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
        let mut file = decrypt(ciphertext, key)?;
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip_sizes() {
        let key = EncryptionKey::generate();
        for len in [0, 1, 15, 16, 17, 63, 64, 65, 4096, DECRYPT_WINDOW - 1, DECRYPT_WINDOW, DECRYPT_WINDOW + TAG_SIZE, 100_000] {
            let plaintext = random_bytes(len);
            let ciphertext = encrypt(&plaintext, &key).unwrap();
            assert_eq!(ciphertext.len(), len + TAG_SIZE);

            let decrypted = decrypt_all(&ciphertext, &key).unwrap();
            assert_eq!(decrypted, plaintext, "round trip failed for {} bytes", len);
            assert_eq!(decrypt_to_vec(&ciphertext, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_streaming_matches_buffered() {
        let key = EncryptionKey::generate();
        let plaintext = random_bytes(50_000);
        let expected = encrypt(&plaintext, &key).unwrap();

        let mut streamed = Vec::new();
        EncryptReader::new(Trickle { data: &plaintext, step: 7 }, &key)
            .unwrap()
            .read_to_end(&mut streamed)
            .unwrap();
        assert_eq!(streamed, expected);

        let decrypted = decrypt(Trickle { data: &expected, step: 13 }, &key).unwrap();
        assert_eq!(decrypted.len(), plaintext.len() as u64);
    }

    #[test]
    fn test_any_bit_flip_is_detected() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(b"the quick brown fox", &key).unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(decrypt(&tampered[..], &key), Err(Error::Decrypt)),
                    "flip at byte {} bit {} went unnoticed",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = encrypt(b"secret", &EncryptionKey::generate()).unwrap();
        let other = EncryptionKey::generate();
        assert!(matches!(decrypt(&ciphertext[..], &other), Err(Error::Decrypt)));
        assert!(matches!(decrypt_to_vec(&ciphertext, &other), Err(Error::Decrypt)));
    }

    #[test]
    fn test_short_input_fails() {
        let key = EncryptionKey::generate();
        for len in [0, 1, 63] {
            let data = random_bytes(len);
            assert!(matches!(decrypt(&data[..], &key), Err(Error::Decrypt)));
            assert!(matches!(decrypt_to_vec(&data, &key), Err(Error::Decrypt)));
        }
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&random_bytes(1000), &key).unwrap();
        let truncated = &ciphertext[..ciphertext.len() - 1];
        assert!(matches!(decrypt(truncated, &key), Err(Error::Decrypt)));
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        // Identical plaintext under one key yields identical ciphertext.
        let key = EncryptionKey::generate();
        assert_eq!(encrypt(b"docs", &key).unwrap(), encrypt(b"docs", &key).unwrap());
    }

    #[test]
    fn test_decrypted_file_is_seekable() {
        let key = EncryptionKey::generate();
        let plaintext: Vec<u8> = (0..=255u8).cycle().take(40_000).collect();
        let ciphertext = encrypt(&plaintext, &key).unwrap();

        let mut file = decrypt(&ciphertext[..], &key).unwrap();
        file.seek(SeekFrom::Start(30_000)).unwrap();
        let mut buf = [0u8; 16];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[30_000..30_016]);
    }
}
