use std::path::Path;

use anyhow::{Context, Result};
use http::HeaderMap;
use tracing::{error, warn};

use super::key::{decode_key, url_prefix, vary_match};
use super::{CacheEntry, ContentHash, HASH_LEN, Source, StoredMeta};

/// The metadata index: an ordered key/value store mapping request keys to
/// `content hash ‖ serialised metadata`. Multiple variants of one URL share
/// a key prefix and are distinguished by their Vary pairs.
#[derive(Clone)]
pub(super) struct MetaIndex {
    db: sled::Db,
}

impl MetaIndex {
    pub(super) fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open metadata index in {}", path.display()))?;
        Ok(Self { db })
    }

    pub(super) fn put(&self, key: &[u8], hash: ContentHash, meta: &StoredMeta) -> Result<()> {
        let encoded = serde_json::to_vec(meta).context("failed to encode cache metadata")?;
        let mut value = Vec::with_capacity(HASH_LEN + encoded.len());
        value.extend_from_slice(hash.as_bytes());
        value.extend_from_slice(&encoded);
        self.db
            .insert(key, value)
            .context("failed to write metadata index entry")?;
        Ok(())
    }

    pub(super) fn delete(&self, key: &[u8]) {
        if let Err(err) = self.db.remove(key) {
            warn!(error = %err, "failed to delete metadata index entry");
        }
    }

    /// All stored variants of `url` whose Vary pairs match the request.
    pub(super) fn lookup(&self, url: &str, request_headers: &HeaderMap) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(url_prefix(url)) {
            let (key, value) = match item {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "metadata index iteration failed");
                    break;
                }
            };

            let (_, fields, values) = match decode_key(&key) {
                Some(decoded) => decoded,
                None => {
                    error!("malformed metadata index key; skipping entry");
                    continue;
                }
            };
            if !vary_match(&fields, &values, request_headers) {
                continue;
            }

            let (hash, meta) = match decode_value(&value) {
                Some(decoded) => decoded,
                None => {
                    // Treated as absent; the metadata prune pass removes
                    // records whose hash has no usage entry.
                    error!("corrupt metadata index value; skipping entry");
                    continue;
                }
            };

            entries.push(CacheEntry {
                meta,
                hash,
                key: key.to_vec(),
                source: Source::Cache,
            });
        }
        entries
    }

    /// Runs `visit` over every entry, yielding the raw key and content hash.
    /// Used by the metadata prune pass.
    pub(super) fn for_each_hash(&self, mut visit: impl FnMut(&[u8], Option<ContentHash>)) {
        for item in self.db.iter() {
            match item {
                Ok((key, value)) => {
                    let hash = value
                        .get(..HASH_LEN)
                        .and_then(ContentHash::from_slice);
                    visit(&key, hash);
                }
                Err(err) => {
                    error!(error = %err, "metadata index iteration failed");
                    break;
                }
            }
        }
    }

    pub(super) fn remove_raw(&self, key: &[u8]) -> Result<()> {
        self.db
            .remove(key)
            .context("failed to delete metadata index entry")?;
        Ok(())
    }

    pub(super) fn flush(&self) -> Result<()> {
        self.db.flush().context("failed to flush metadata index")?;
        Ok(())
    }
}

fn decode_value(value: &[u8]) -> Option<(ContentHash, StoredMeta)> {
    if value.len() < HASH_LEN {
        return None;
    }
    let hash = ContentHash::from_slice(&value[..HASH_LEN])?;
    let meta: StoredMeta = serde_json::from_slice(&value[HASH_LEN..]).ok()?;
    Some((hash, meta))
}
