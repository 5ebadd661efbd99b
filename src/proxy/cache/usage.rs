use std::fs;
use std::thread;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::meta::MetaIndex;
use super::store::BlobStore;
#[allow(unused_imports)]
use super::{ContentHash, HASH_LEN};

const SAMPLE_CHANNEL_CAPACITY: usize = 16;

const USAGE_SCHEMA_VERSION: u32 = 1;

fn usage_schema_version() -> u32 {
    USAGE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleSource {
    /// An admission or a cache hit.
    Live,
    /// Synthesised by the startup directory scan.
    Startup,
}

/// One usage observation for a blob, submitted to the eviction worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
    pub hash: ContentHash,
    pub use_time: i64,
    pub size: i64,
    pub source: SampleSource,
}

/// Byte thresholds driving the eviction loop: exceeding `high_water`
/// triggers a pass that prunes down to `low_water`.
#[derive(Debug, Clone, Copy)]
pub struct EvictionConfig {
    pub low_water: i64,
    pub high_water: i64,
    pub prune_chunk_size: usize,
}

/// Per-blob usage accounting. Unknown fields are ignored on decode and
/// missing fields default to zero.
#[derive(Debug, Serialize, Deserialize)]
struct UsageRecord {
    #[serde(default = "usage_schema_version")]
    schema: u32,
    #[serde(default)]
    last_used: i64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    use_count: i32,
}

/// Starts the eviction worker on its own OS thread. The worker is the sole
/// mutator of the usage index; every other component only submits samples.
pub(super) fn spawn_worker(
    store: BlobStore,
    meta: MetaIndex,
    usage: sled::Db,
    config: EvictionConfig,
) -> Result<mpsc::Sender<Sample>> {
    let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
    let scan_tx = tx.clone();

    thread::Builder::new()
        .name("cachet-eviction".to_string())
        .spawn(move || {
            let scanner = {
                let store = store.clone();
                thread::Builder::new()
                    .name("cachet-scan".to_string())
                    .spawn(move || scan_existing_blobs(&store, scan_tx))
            };
            run_worker(rx, &store, &meta, &usage, config);
            if let Ok(handle) = scanner {
                let _ = handle.join();
            }
        })
        .context("failed to spawn eviction worker thread")?;

    Ok(tx)
}

/// One-shot walk over the 256 shard directories, feeding pre-existing blobs
/// into the same channel live admissions use.
fn scan_existing_blobs(store: &BlobStore, tx: mpsc::Sender<Sample>) {
    debug!(dir = %store.base().display(), "indexing pre-existing cache blobs");
    let mut count = 0u64;
    let mut total_size = 0i64;

    for shard in 0..=255u32 {
        let part = format!("{shard:02x}");
        let dir = store.base().join(&part);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!(error = %err, dir = %dir.display(), "cannot open cache shard");
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!(error = %err, dir = %dir.display(), "cannot read cache shard");
                    break;
                }
            };
            let name = format!("{}{}", part, entry.file_name().to_string_lossy());
            let hash = match ContentHash::from_hex(&name) {
                Some(hash) => hash,
                None => {
                    error!(name, "malformed cache blob name");
                    continue;
                }
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    error!(error = %err, name, "cannot stat cache blob");
                    continue;
                }
            };
            let mtime = metadata
                .modified()
                .map(crate::util::unix_seconds)
                .unwrap_or(0);
            let size = metadata.len() as i64;

            let sample = Sample {
                hash,
                use_time: mtime,
                size,
                source: SampleSource::Startup,
            };
            if tx.blocking_send(sample).is_err() {
                return;
            }
            count += 1;
            total_size += size;
        }
    }
    info!(count, total_size, "found pre-existing cache blobs");
}

fn run_worker(
    mut rx: mpsc::Receiver<Sample>,
    store: &BlobStore,
    meta: &MetaIndex,
    usage: &sled::Db,
    config: EvictionConfig,
) {
    let mut total_bytes: i64 = 0;

    while let Some(sample) = rx.blocking_recv() {
        total_bytes += update_record(usage, &sample);
        crate::metrics::set_cache_bytes(total_bytes);

        if total_bytes > config.high_water {
            total_bytes = run_eviction_cycle(store, meta, usage, total_bytes, &config);
            crate::metrics::set_cache_bytes(total_bytes);
        }
    }

    debug!("stopping cache eviction worker");
    if let Err(err) = usage.flush() {
        warn!(error = %err, "failed to flush usage index on shutdown");
    }
}

/// Updates the usage record for one sample, returning the byte delta to add
/// to the running total. Records whose size disagrees with the observed
/// size are corrupt and treated as absent.
fn update_record(usage: &sled::Db, sample: &Sample) -> i64 {
    let key = sample.hash.as_bytes();
    let mut record = match usage.get(key) {
        Ok(Some(raw)) => match serde_json::from_slice::<UsageRecord>(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                error!(error = %err, "corrupt usage record; treating as absent");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            error!(error = %err, "failed to read usage record");
            None
        }
    };

    if let Some(existing) = &record
        && existing.size != sample.size
    {
        error!(
            recorded = existing.size,
            observed = sample.size,
            "usage record size mismatch; treating as absent"
        );
        record = None;
    }

    // The startup scan accounts for existing blobs exactly once and never
    // refreshes their recency.
    if sample.source == SampleSource::Startup && let Some(existing) = &record {
        return existing.size;
    }

    let delta;
    let updated = match record {
        None => {
            delta = sample.size;
            UsageRecord {
                schema: USAGE_SCHEMA_VERSION,
                last_used: sample.use_time,
                size: sample.size,
                use_count: 1,
            }
        }
        Some(mut existing) => {
            delta = 0;
            existing.last_used = sample.use_time;
            existing.use_count = existing.use_count.saturating_add(1);
            existing
        }
    };

    match serde_json::to_vec(&updated) {
        Ok(encoded) => {
            if let Err(err) = usage.insert(key, encoded) {
                error!(error = %err, "failed to write usage record");
            }
        }
        Err(err) => error!(error = %err, "failed to encode usage record"),
    }

    delta
}

struct Victim {
    key: Vec<u8>,
    size: i64,
    score: f64,
}

/// Bounded top-K candidate list, ordered by descending score. Higher score
/// means evicted sooner.
struct Candidates {
    items: Vec<Victim>,
    cap: usize,
}

impl Candidates {
    fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            cap,
        }
    }

    fn add(&mut self, victim: Victim) {
        let len = self.items.len();
        if len >= self.cap
            && self
                .items
                .last()
                .map(|last| last.score >= victim.score)
                .unwrap_or(false)
        {
            return;
        }
        let index = self
            .items
            .partition_point(|item| item.score >= victim.score);
        if index == len && len >= self.cap {
            return;
        }
        self.items.insert(index, victim);
        if self.items.len() > self.cap {
            self.items.pop();
        }
    }
}

/// Selects eviction candidates from the usage index. The current policy is
/// LRU on `last_used`; undecodable records go first.
fn select_candidates(usage: &sled::Db, prune_chunk_size: usize) -> Candidates {
    let mut candidates = Candidates::new(prune_chunk_size);
    for item in usage.iter() {
        let (key, value) = match item {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "usage index iteration failed");
                break;
            }
        };
        let (score, size) = match serde_json::from_slice::<UsageRecord>(&value) {
            Ok(record) => (-(record.last_used as f64), record.size),
            Err(err) => {
                error!(error = %err, "undecodable usage record; evicting first");
                (f64::INFINITY, 0)
            }
        };
        candidates.add(Victim {
            key: key.to_vec(),
            size,
            score,
        });
    }
    debug!(count = candidates.items.len(), "selected eviction candidates");
    candidates
}

fn run_eviction_cycle(
    store: &BlobStore,
    meta: &MetaIndex,
    usage: &sled::Db,
    mut total_bytes: i64,
    config: &EvictionConfig,
) -> i64 {
    let candidates = select_candidates(usage, config.prune_chunk_size);

    let mut evicted = 0usize;
    let mut evicted_bytes = 0i64;
    for victim in &candidates.items {
        if total_bytes <= config.low_water {
            break;
        }
        if let Some(hash) = ContentHash::from_slice(&victim.key) {
            if let Err(err) = store.remove_blob_blocking(hash) {
                error!(error = %err, hash = %hash.to_hex(), "cannot remove cache blob");
            }
        }
        if let Err(err) = usage.remove(&victim.key) {
            error!(error = %err, "cannot delete usage record");
        }
        evicted += 1;
        evicted_bytes += victim.size;
        total_bytes -= victim.size;
        crate::metrics::record_cache_eviction();
    }
    info!(
        evicted,
        evicted_bytes, total_bytes, "eviction pass finished"
    );

    prune_metadata(meta, usage);
    total_bytes
}

/// Drops metadata rows whose content hash no longer has a usage record.
/// Runs on the eviction worker, so no admission races the delete decisions.
fn prune_metadata(meta: &MetaIndex, usage: &sled::Db) {
    let mut pruned = 0usize;
    let mut stale = Vec::new();
    meta.for_each_hash(|key, hash| {
        let live = match hash {
            Some(hash) => usage.contains_key(hash.as_bytes()).unwrap_or(true),
            None => false,
        };
        if !live {
            stale.push(key.to_vec());
        }
    });
    for key in stale {
        match meta.remove_raw(&key) {
            Ok(()) => pruned += 1,
            Err(err) => error!(error = %err, "cannot prune metadata entry"),
        }
    }
    info!(pruned, "pruned metadata entries");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(last_used: i64, size: i64) -> Vec<u8> {
        serde_json::to_vec(&UsageRecord {
            schema: USAGE_SCHEMA_VERSION,
            last_used,
            size,
            use_count: 1,
        })
        .expect("record encodes")
    }

    fn sample(hash_byte: u8, use_time: i64, size: i64, source: SampleSource) -> Sample {
        Sample {
            hash: ContentHash::from_bytes([hash_byte; HASH_LEN]),
            use_time,
            size,
            source,
        }
    }

    fn open_usage() -> (tempfile::TempDir, sled::Db) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let db = sled::open(dir.path().join("index")).expect("usage opens");
        (dir, db)
    }

    #[test]
    fn first_sample_creates_record_and_returns_size() {
        let (_dir, usage) = open_usage();
        let delta = update_record(&usage, &sample(1, 100, 42, SampleSource::Live));
        assert_eq!(delta, 42);

        let raw = usage
            .get([1u8; HASH_LEN])
            .unwrap()
            .expect("record exists");
        let decoded: UsageRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.last_used, 100);
        assert_eq!(decoded.size, 42);
        assert_eq!(decoded.use_count, 1);
    }

    #[test]
    fn repeat_live_sample_updates_recency_without_delta() {
        let (_dir, usage) = open_usage();
        update_record(&usage, &sample(1, 100, 42, SampleSource::Live));
        let delta = update_record(&usage, &sample(1, 200, 42, SampleSource::Live));
        assert_eq!(delta, 0);

        let raw = usage.get([1u8; HASH_LEN]).unwrap().unwrap();
        let decoded: UsageRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.last_used, 200);
        assert_eq!(decoded.use_count, 2);
    }

    #[test]
    fn startup_sample_accounts_existing_record_without_touching_it() {
        let (_dir, usage) = open_usage();
        update_record(&usage, &sample(1, 100, 42, SampleSource::Live));
        let delta = update_record(&usage, &sample(1, 999, 42, SampleSource::Startup));
        assert_eq!(delta, 42, "startup scan re-accounts persisted blobs");

        let raw = usage.get([1u8; HASH_LEN]).unwrap().unwrap();
        let decoded: UsageRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.last_used, 100, "startup must not refresh recency");
        assert_eq!(decoded.use_count, 1);
    }

    #[test]
    fn size_mismatch_discards_the_record() {
        let (_dir, usage) = open_usage();
        update_record(&usage, &sample(1, 100, 42, SampleSource::Live));
        let delta = update_record(&usage, &sample(1, 200, 17, SampleSource::Live));
        assert_eq!(delta, 17, "record rebuilt from observed size");

        let raw = usage.get([1u8; HASH_LEN]).unwrap().unwrap();
        let decoded: UsageRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.size, 17);
        assert_eq!(decoded.use_count, 1);
    }

    #[test]
    fn use_count_saturates() {
        let (_dir, usage) = open_usage();
        usage
            .insert([1u8; HASH_LEN], record(100, 42))
            .expect("seed record");
        let raw = usage.get([1u8; HASH_LEN]).unwrap().unwrap();
        let mut seeded: UsageRecord = serde_json::from_slice(&raw).unwrap();
        seeded.use_count = i32::MAX;
        usage
            .insert([1u8; HASH_LEN], serde_json::to_vec(&seeded).unwrap())
            .unwrap();

        update_record(&usage, &sample(1, 200, 42, SampleSource::Live));
        let raw = usage.get([1u8; HASH_LEN]).unwrap().unwrap();
        let decoded: UsageRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.use_count, i32::MAX);
    }

    #[test]
    fn candidates_keep_lowest_recency_first() {
        let mut candidates = Candidates::new(2);
        candidates.add(Victim {
            key: vec![1],
            size: 1,
            score: -100.0,
        });
        candidates.add(Victim {
            key: vec![2],
            size: 1,
            score: -50.0,
        });
        candidates.add(Victim {
            key: vec![3],
            size: 1,
            score: -200.0,
        });

        // score = -last_used, so the oldest entries carry the highest
        // scores; the retained top-2 are last_used 50 and 100.
        let keys: Vec<u8> = candidates.items.iter().map(|v| v.key[0]).collect();
        assert_eq!(keys, vec![2, 1]);
    }

    #[test]
    fn malformed_records_are_selected_first() {
        let (_dir, usage) = open_usage();
        usage.insert([1u8; HASH_LEN], record(100, 10)).unwrap();
        usage.insert([2u8; HASH_LEN], b"garbage".to_vec()).unwrap();

        let candidates = select_candidates(&usage, 10);
        assert_eq!(candidates.items.len(), 2);
        assert_eq!(candidates.items[0].key, vec![2u8; HASH_LEN]);
        assert!(candidates.items[0].score.is_infinite());
    }

    #[test]
    fn usage_record_tolerates_missing_and_unknown_fields() {
        let decoded: UsageRecord = serde_json::from_str("{}").expect("empty record decodes");
        assert_eq!(decoded.last_used, 0);
        assert_eq!(decoded.size, 0);
        assert_eq!(decoded.use_count, 0);

        let decoded: UsageRecord =
            serde_json::from_str("{\"last_used\":5,\"size\":6,\"use_count\":7,\"new_field\":8}")
                .expect("unknown fields ignored");
        assert_eq!(decoded.last_used, 5);
    }
}
