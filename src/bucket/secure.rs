//! Secure bucket client
//!
//! Wraps a raw [`BucketClient`] so that every path is encrypted segment by
//! segment and every object body goes through the stream cipher. Callers
//! work in plaintext paths and bytes only.

use crate::bucket::client::{AccessRoles, BoxReader, BucketClient, ListPathResponse, PathItem, PushResult};
use crate::bucket::pipe::chunk_pipe;
use crate::bucket::session::BucketSession;
use crate::config::ListingPolicy;
use crate::crypto::{decode_path, decode_segment, decrypt, encode_path, EncryptReader, EncryptionKey, TAG_SIZE};
use crate::error::Result;
use regex::Regex;
use std::io::{self, Write};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

/// In-flight chunks between the remote download and the decrypter
const PIPE_DEPTH: usize = 8;

/// Gateway-style address of a listed item; `rel` is the in-bucket path
static GATEWAY_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/ip[fn]s/[^/]*(?P<rel>/.*)").expect("gateway path pattern"));

/// Bucket client that encrypts paths and content end to end
#[derive(Clone)]
pub struct SecureBucketClient {
    inner: Arc<dyn BucketClient>,
    policy: ListingPolicy,
}

impl SecureBucketClient {
    pub fn new(inner: Arc<dyn BucketClient>, policy: ListingPolicy) -> Self {
        SecureBucketClient { inner, policy }
    }

    /// The wrapped raw client
    pub fn raw(&self) -> &Arc<dyn BucketClient> {
        &self.inner
    }

    pub fn policy(&self) -> ListingPolicy {
        self.policy
    }

    /// Encrypt `reader` and store it at `path`
    pub async fn push_path(
        &self,
        session: &BucketSession,
        path: &str,
        reader: BoxReader,
    ) -> Result<PushResult> {
        let key = session.encryption_key()?;
        let encoded = encode_path(path, key)?;
        debug!("push_path: bucket={}, path={}", session.slug, path);

        let sealed: BoxReader = Box::new(EncryptReader::new(reader, key)?);
        let mut result = self
            .inner
            .push_path(&session.root_key, &encoded, sealed)
            .await?;
        if let Ok(decoded) = decode_gateway_path(&result.path, key) {
            result.path = decoded;
        }
        Ok(result)
    }

    /// Fetch `path` and write the verified plaintext into `writer`
    ///
    /// The download is piped into the decrypter as it arrives; nothing is
    /// written to `writer` until the authentication tag has been checked.
    /// Both ends of the pipe block, so both run on the blocking pool.
    pub async fn pull_path(
        &self,
        session: &BucketSession,
        path: &str,
        writer: &mut (dyn Write + Send),
    ) -> Result<()> {
        let key = session.encryption_key()?.clone();
        let encoded = encode_path(path, &key)?;
        debug!("pull_path: bucket={}, path={}", session.slug, path);

        let (mut pipe_writer, pipe_reader) = chunk_pipe(PIPE_DEPTH);
        let decrypter = tokio::task::spawn_blocking(move || decrypt(pipe_reader, &key));

        let inner = self.inner.clone();
        let root_key = session.root_key.clone();
        let handle = tokio::runtime::Handle::current();
        let downloader = tokio::task::spawn_blocking(move || {
            let pulled = handle.block_on(inner.pull_path(&root_key, &encoded, &mut pipe_writer));
            match &pulled {
                Ok(()) => drop(pipe_writer),
                Err(e) => pipe_writer.fail(e.to_string()),
            }
            pulled
        });

        let pulled = downloader.await?;
        let decrypted = decrypter.await?;
        pulled?;
        let mut plaintext = decrypted?;

        io::copy(&mut plaintext, writer)?;
        writer.flush()?;
        Ok(())
    }

    /// List `path`, decrypting names, paths and sizes of the returned items
    pub async fn list_path(&self, session: &BucketSession, path: &str) -> Result<ListPathResponse> {
        let key = session.encryption_key()?;
        let encoded = encode_path(path, key)?;
        debug!("list_path: bucket={}, path={}", session.slug, path);

        let mut response = self.inner.list_path(&session.root_key, &encoded).await?;
        response.item = self.decode_listed(response.item, path, key)?;
        Ok(response)
    }

    /// Remove a file or directory
    pub async fn remove_path(&self, session: &BucketSession, path: &str) -> Result<()> {
        let key = session.encryption_key()?;
        let encoded = encode_path(path, key)?;
        debug!("remove_path: bucket={}, path={}", session.slug, path);
        self.inner.remove_path(&session.root_key, &encoded).await
    }

    pub async fn set_access_roles(
        &self,
        session: &BucketSession,
        path: &str,
        roles: AccessRoles,
    ) -> Result<()> {
        let key = session.encryption_key()?;
        let encoded = encode_path(path, key)?;
        self.inner
            .push_access_roles(&session.root_key, &encoded, roles)
            .await
    }

    pub async fn get_access_roles(&self, session: &BucketSession, path: &str) -> Result<AccessRoles> {
        let key = session.encryption_key()?;
        let encoded = encode_path(path, key)?;
        self.inner.pull_access_roles(&session.root_key, &encoded).await
    }

    /// The listed item itself is named after the requested path; only its
    /// children carry encrypted names.
    fn decode_listed(&self, mut item: PathItem, path: &str, key: &EncryptionKey) -> Result<PathItem> {
        let trimmed = path.trim_matches('/');
        if !trimmed.is_empty() {
            item.name = trimmed.rsplit('/').next().unwrap_or(trimmed).to_string();
        }
        if let Ok(decoded) = decode_gateway_path(&item.path, key) {
            item.path = decoded;
        }
        item.size = plaintext_size(&item);
        item.items = self.decode_children(std::mem::take(&mut item.items), key)?;
        Ok(item)
    }

    fn decode_children(&self, items: Vec<PathItem>, key: &EncryptionKey) -> Result<Vec<PathItem>> {
        let mut decoded = Vec::with_capacity(items.len());
        for item in items {
            let raw_name = item.name.clone();
            match self.decode_item(item, key) {
                Ok(item) => decoded.push(item),
                Err(e) => match self.policy {
                    ListingPolicy::SkipUndecryptable => {
                        warn!("Skipping undecryptable entry {}: {}", raw_name, e);
                    }
                    ListingPolicy::FailListing => return Err(e),
                },
            }
        }
        Ok(decoded)
    }

    fn decode_item(&self, mut item: PathItem, key: &EncryptionKey) -> Result<PathItem> {
        item.name = decode_segment(&item.name, key)?;
        item.path = decode_gateway_path(&item.path, key)?;
        item.size = plaintext_size(&item);
        item.items = self.decode_children(std::mem::take(&mut item.items), key)?;
        Ok(item)
    }
}

fn decode_gateway_path(path: &str, key: &EncryptionKey) -> Result<String> {
    match GATEWAY_PATH.captures(path).and_then(|c| c.name("rel")) {
        Some(rel) => Ok(format!(
            "{}{}",
            &path[..rel.start()],
            decode_path(rel.as_str(), key)?
        )),
        None => Ok(path.to_string()),
    }
}

fn plaintext_size(item: &PathItem) -> u64 {
    if !item.is_dir && item.size >= TAG_SIZE as u64 {
        item.size - TAG_SIZE as u64
    } else {
        item.size
    }
}
