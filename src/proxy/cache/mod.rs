use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub mod key;
mod meta;
mod store;
mod usage;
mod writer;

use meta::MetaIndex;
use store::BlobStore;
pub use usage::EvictionConfig;
use usage::{Sample, SampleSource};
use writer::{BlobWriter, DiskWriter};

pub const HASH_LEN: usize = 32;

const META_SCHEMA_VERSION: u32 = 1;

fn meta_schema_version() -> u32 {
    META_SCHEMA_VERSION
}

/// Digest of a response body; the primary key of the blob store. Two
/// byte-identical bodies share one hash and therefore one blob file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(HASH_LEN * 2);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != HASH_LEN * 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        for (index, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[index] = (hi * 16 + lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Persisted description of a stored response. Serialised as JSON so later
/// schema versions can add fields without breaking old readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMeta {
    #[serde(default = "meta_schema_version")]
    pub schema: u32,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub response_time_unix_nanos: i64,
    #[serde(default)]
    pub response_delay_nanos: i64,
}

impl StoredMeta {
    pub fn new(
        status: StatusCode,
        headers: &HeaderMap,
        response_time: SystemTime,
        response_delay: Duration,
    ) -> Self {
        Self {
            schema: META_SCHEMA_VERSION,
            status: status.as_u16(),
            headers: header_map_to_pairs(headers),
            response_time_unix_nanos: crate::util::unix_nanos(response_time),
            response_delay_nanos: response_delay.as_nanos() as i64,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        pairs_to_header_map(&self.headers)
    }

    pub fn set_headers(&mut self, headers: &HeaderMap) {
        self.headers = header_map_to_pairs(headers);
    }

    pub fn response_time(&self) -> SystemTime {
        crate::util::system_time_from_nanos(self.response_time_unix_nanos)
    }

    pub fn response_delay_secs(&self) -> i64 {
        self.response_delay_nanos / 1_000_000_000
    }

    /// The origin's Date header, if present and parseable.
    pub fn date(&self) -> Option<SystemTime> {
        crate::util::parse_date_header(&self.header_map(), "date")
    }
}

pub fn header_map_to_pairs(map: &HeaderMap) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value) = value.to_str() {
            pairs.push((name.as_str().to_string(), value.to_string()));
        }
    }
    pairs
}

pub fn pairs_to_header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

/// Where a response came from; error responses are synthesised by the
/// pipeline and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Upstream,
    Error,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Upstream => "upstream",
            Source::Error => "error",
        }
    }
}

/// A stored response produced by a lookup. The body is opened lazily via
/// `Cache::open_body`, because a lookup may race with eviction.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: StoredMeta,
    pub hash: ContentHash,
    /// The index key this entry was loaded under; used by `update`.
    pub key: Vec<u8>,
    pub source: Source,
}

impl CacheEntry {
    pub fn date(&self) -> Option<SystemTime> {
        self.meta.date()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cached body is no longer present")]
    MissingBlob,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An opened cached body.
#[derive(Debug)]
pub struct CacheBody {
    pub file: tokio::fs::File,
    pub size: u64,
}

/// Sink for one response body being admitted to the cache. Commit only
/// after the body completed without error from any side.
#[async_trait]
pub trait BodySink: Send {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn discard(self: Box<Self>);
}

/// The capability set the pipeline needs from a cache.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Every stored variant matching the request, in no particular order.
    async fn retrieve(&self, url: &str, request_headers: &HeaderMap) -> Vec<CacheEntry>;

    /// Starts admission of a response body. The metadata carries the
    /// response headers; the request headers select the Vary variant.
    async fn open_writer(
        &self,
        url: &str,
        request_headers: &HeaderMap,
        meta: StoredMeta,
    ) -> Result<Box<dyn BodySink>>;

    async fn open_body(&self, entry: &CacheEntry) -> Result<CacheBody, StoreError>;

    /// Rewrites the metadata of an existing entry after a 304 update.
    async fn update(&self, entry: &CacheEntry);

    async fn close(&self);
}

/// No-op cache used when no cache directory is configured and by tests.
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn retrieve(&self, _url: &str, _request_headers: &HeaderMap) -> Vec<CacheEntry> {
        Vec::new()
    }

    async fn open_writer(
        &self,
        _url: &str,
        _request_headers: &HeaderMap,
        _meta: StoredMeta,
    ) -> Result<Box<dyn BodySink>> {
        Ok(Box::new(NullSink))
    }

    async fn open_body(&self, _entry: &CacheEntry) -> Result<CacheBody, StoreError> {
        Err(StoreError::MissingBlob)
    }

    async fn update(&self, _entry: &CacheEntry) {}

    async fn close(&self) {}
}

struct NullSink;

#[async_trait]
impl BodySink for NullSink {
    async fn write_all(&mut self, _buf: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn discard(self: Box<Self>) {}
}

/// The persistent cache: a content-addressed blob store plus the metadata
/// and usage indices. Admissions stream through temp files and are linked
/// into place on commit; eviction runs on a dedicated worker thread.
pub struct DiskCache {
    store: BlobStore,
    meta: MetaIndex,
    samples: mpsc::Sender<Sample>,
}

impl DiskCache {
    pub fn open(base: &Path, config: EvictionConfig) -> Result<Self> {
        let store = BlobStore::init(base)
            .with_context(|| format!("failed to initialise content store in {}", base.display()))?;
        let meta = MetaIndex::open(&base.join("meta"))?;
        let usage = sled::open(base.join("index"))
            .with_context(|| format!("failed to open usage index in {}", base.display()))?;
        let samples = usage::spawn_worker(store.clone(), meta.clone(), usage, config)?;
        Ok(Self {
            store,
            meta,
            samples,
        })
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn retrieve(&self, url: &str, request_headers: &HeaderMap) -> Vec<CacheEntry> {
        let meta = self.meta.clone();
        let url = url.to_string();
        let request_headers = request_headers.clone();
        match tokio::task::spawn_blocking(move || meta.lookup(&url, &request_headers)).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "cache lookup task failed");
                Vec::new()
            }
        }
    }

    async fn open_writer(
        &self,
        url: &str,
        request_headers: &HeaderMap,
        meta: StoredMeta,
    ) -> Result<Box<dyn BodySink>> {
        let key = key::request_key(url, &meta.header_map(), request_headers);
        let (file, temp_path) = self.store.create_temp().await?;
        let blob = BlobWriter::new(file, temp_path);
        Ok(Box::new(DiskWriter::new(
            blob,
            key,
            meta,
            self.store.clone(),
            self.meta.clone(),
            self.samples.clone(),
        )))
    }

    async fn open_body(&self, entry: &CacheEntry) -> Result<CacheBody, StoreError> {
        match self.store.open_body(entry.hash).await {
            Ok((file, size)) => {
                // Hit accounting is best-effort; a full channel drops the
                // sample rather than stalling the response.
                let sample = Sample {
                    hash: entry.hash,
                    use_time: crate::util::unix_seconds(SystemTime::now()),
                    size: size as i64,
                    source: SampleSource::Live,
                };
                let _ = self.samples.try_send(sample);
                Ok(CacheBody { file, size })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // The blob lost a race with eviction; drop the now-dangling
                // metadata row so later lookups skip it.
                let meta = self.meta.clone();
                let key = entry.key.clone();
                let _ = tokio::task::spawn_blocking(move || meta.delete(&key)).await;
                Err(StoreError::MissingBlob)
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn update(&self, entry: &CacheEntry) {
        if entry.key.is_empty() {
            return;
        }
        let meta = self.meta.clone();
        let key = entry.key.clone();
        let hash = entry.hash;
        let stored = entry.meta.clone();
        let result =
            tokio::task::spawn_blocking(move || meta.put(&key, hash, &stored)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to update cache metadata"),
            Err(err) => warn!(error = %err, "cache update task failed"),
        }
    }

    async fn close(&self) {
        let meta = self.meta.clone();
        let result = tokio::task::spawn_blocking(move || meta.flush()).await;
        if let Ok(Err(err)) = result {
            warn!(error = %err, "failed to flush cache metadata");
        }
    }
}
