use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::*;

/// Where a [`FeatureCache`] keeps its entries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Root directory of the store.
    pub store_location: PathBuf,
    /// Subdirectory holding the entries of one pipeline configuration.
    pub namespace_key: String,
}

/// What `get_or_compute` does with an entry that fails to load.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionPolicy {
    /// Log, count, recompute and overwrite.
    Recompute,
    /// Return the corruption error.
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub corrupt: usize,
}

/// On-disk record of one entry.
#[derive(Serialize, Deserialize)]
struct CacheRecord {
    key: String,
    vector_length: u64,
    vector: Vec<f64>,
}

/// Persistent store of final feature vectors keyed by input identity.
///
/// Entries live one per file and are written through a temporary file that is
/// renamed into place, so readers never observe a partial entry. Requests for
/// the same key are serialised, requests for different keys are not.
pub struct FeatureCache {
    dir: PathBuf,
    vector_len: usize,
    policy: CorruptionPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    corrupt: AtomicUsize,
}

impl FeatureCache {
    /// Open (creating if needed) the namespace directory of `config` for
    /// vectors of length `vector_len`.
    pub fn open(config: &CacheConfig, vector_len: usize) -> PhowResult<Self> {
        if config.namespace_key.is_empty()
            || config.namespace_key.contains(|c| c == '/' || c == '\\')
            || config.namespace_key.starts_with('.')
        {
            return Err(PhowErr::Configuration(format!(
                "invalid cache namespace {:?}",
                config.namespace_key
            )));
        }
        let dir = config.store_location.join(&config.namespace_key);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            vector_len,
            policy: CorruptionPolicy::Recompute,
            locks: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            corrupt: AtomicUsize::new(0),
        })
    }

    pub fn with_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vector_len(&self) -> usize {
        self.vector_len
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Read the persisted vector of `key`, if any.
    pub fn get(&self, key: &str) -> PhowResult<Option<FeatureVector>> {
        let bytes = match std::fs::read(self.entry_path(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| PhowErr::CacheCorruption {
            key: key.to_string(),
            reason,
        };
        let record: CacheRecord = bincode::deserialize(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if record.key != key {
            return Err(corrupt(format!("entry belongs to {:?}", record.key)));
        }
        if record.vector_length as usize != record.vector.len() {
            return Err(corrupt(format!(
                "recorded length {} but {} values",
                record.vector_length,
                record.vector.len()
            )));
        }
        if record.vector.len() != self.vector_len {
            return Err(corrupt(format!(
                "vector has length {}, expected {}",
                record.vector.len(),
                self.vector_len
            )));
        }
        Ok(Some(record.vector))
    }

    /// Return the vector of `key`, computing and persisting it on a miss.
    ///
    /// `compute` runs at most once per call and never while another caller
    /// holds the same key.
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> PhowResult<FeatureVector>
    where
        F: FnOnce() -> PhowResult<FeatureVector>,
    {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock();
            self.get_or_compute_locked(key, compute)
        };
        self.release(key, lock);
        result
    }

    fn get_or_compute_locked<F>(&self, key: &str, compute: F) -> PhowResult<FeatureVector>
    where
        F: FnOnce() -> PhowResult<FeatureVector>,
    {
        match self.get(key) {
            Ok(Some(v)) => {
                trace!("Cache hit for {}", key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(v);
            }
            Ok(None) => {
                debug!("Cache miss for {}", key);
            }
            Err(e @ PhowErr::CacheCorruption { .. }) => {
                self.corrupt.fetch_add(1, Ordering::Relaxed);
                if self.policy == CorruptionPolicy::Fail {
                    return Err(e);
                }
                warn!("{}; recomputing", e);
            }
            Err(e) => return Err(e),
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let vector = compute()?;
        check_len("computed feature vector", self.vector_len, vector.len())?;
        self.put(key, &vector)?;
        Ok(vector)
    }

    fn put(&self, key: &str, vector: &[f64]) -> PhowResult<()> {
        let record = CacheRecord {
            key: key.to_string(),
            vector_length: vector.len() as u64,
            vector: vector.to_vec(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            bincode::serialize_into(&mut writer, &record)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.entry_path(key)).map_err(|e| e.error)?;
        Ok(())
    }

    /// File name: checksum and length of the key plus a readable tail of it.
    /// The full key is stored in the record and checked on read.
    fn entry_path(&self, key: &str) -> PathBuf {
        let tail: String = key
            .chars()
            .rev()
            .take(48)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!(
            "{:08x}-{}-{}.fv",
            crc32fast::hash(key.as_bytes()),
            key.len(),
            tail
        ))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once no other caller is waiting on it.
    fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // one reference in the map, one held here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}
