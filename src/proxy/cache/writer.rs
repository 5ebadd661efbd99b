use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use blake3::Hasher;
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::meta::MetaIndex;
use super::store::BlobStore;
use super::usage::{Sample, SampleSource};
use super::{BodySink, ContentHash, HASH_LEN, StoredMeta};

/// Streams a body into a temp file while hashing it. The final name is only
/// known at commit time, when the digest is complete.
pub(super) struct BlobWriter {
    file: AsyncFile,
    hasher: Hasher,
    temp_path: PathBuf,
    size: u64,
    finished: bool,
}

impl BlobWriter {
    pub(super) fn new(file: AsyncFile, temp_path: PathBuf) -> Self {
        Self {
            file,
            hasher: Hasher::new(),
            temp_path,
            size: 0,
            finished: false,
        }
    }

    pub(super) async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buf).await?;
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(())
    }

    /// Flushes the temp file and finalises the digest. The caller owns the
    /// temp file from here and must link or unlink it.
    pub(super) async fn finish(mut self) -> std::io::Result<(ContentHash, u64, PathBuf)> {
        self.file.flush().await?;
        let mut digest = [0u8; HASH_LEN];
        self.hasher.finalize_xof().fill(&mut digest);
        self.finished = true;
        Ok((
            ContentHash::from_bytes(digest),
            self.size,
            self.temp_path.clone(),
        ))
    }

    pub(super) async fn abort(mut self) {
        self.finished = true;
        let _ = async_fs::remove_file(&self.temp_path).await;
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let temp_path = self.temp_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Admission of one response into the persistent cache: tee target for the
/// pipeline's streaming loop, committed after a clean EOF.
pub(crate) struct DiskWriter {
    blob: BlobWriter,
    key: Vec<u8>,
    meta: StoredMeta,
    store: BlobStore,
    index: MetaIndex,
    samples: mpsc::Sender<Sample>,
}

impl DiskWriter {
    pub(super) fn new(
        blob: BlobWriter,
        key: Vec<u8>,
        meta: StoredMeta,
        store: BlobStore,
        index: MetaIndex,
        samples: mpsc::Sender<Sample>,
    ) -> Self {
        Self {
            blob,
            key,
            meta,
            store,
            index,
            samples,
        }
    }
}

#[async_trait]
impl BodySink for DiskWriter {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.blob.write_all(buf).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            blob,
            key,
            meta,
            store,
            index,
            samples,
        } = *self;

        let (hash, size, temp_path) = blob
            .finish()
            .await
            .context("failed to finalise cache temp file")?;

        let link_result = store.link_blob(&temp_path, hash).await;
        let _ = async_fs::remove_file(&temp_path).await;
        link_result.context("failed to link cache blob into place")?;

        let put_index = index.clone();
        let put_key = key.clone();
        let put_meta = meta.clone();
        tokio::task::spawn_blocking(move || put_index.put(&put_key, hash, &put_meta))
            .await
            .context("metadata write task failed")??;

        trace!(hash = %hash.to_hex(), size, "committed cache entry");
        crate::metrics::record_cache_store();

        // Commit accounting must reach the eviction worker; block on channel
        // capacity rather than dropping the sample.
        let sample = Sample {
            hash,
            use_time: crate::util::unix_seconds(SystemTime::now()),
            size: size as i64,
            source: SampleSource::Live,
        };
        if samples.send(sample).await.is_err() {
            warn!("usage sample channel closed; eviction accounting lost");
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) {
        self.blob.abort().await;
    }
}
