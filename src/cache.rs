//! Cache: a byte-addressable opaque-blob key-value store and the key
//! builders that turn a segment or cell identity into a cache key, per
//! spec.md §4.4.
//!
//! Grounded on `seqvars/query/annonars.rs`'s `rocksdb::DBWithThreadMode`
//! usage for the concrete backend; the key layout mirrors
//! `LDServer.cpp`'s `make_segment_cache_key`/`make_cell_cache_key`.

use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::common::StatKind;
use crate::error::{Error, Result};

/// Opaque byte-addressable store: get/set by key, no notion of the value's
/// shape. [`Segment`](crate::segment::Segment) and
/// [`Cell`](crate::cell::Cell) serialize themselves to/from these blobs.
pub trait Cache: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Cache key for a segment's names-only form: dataset fingerprint, subset
/// name, chromosome, start/stop bp.
pub fn segment_key(
    dataset_fingerprint: u32,
    subset_name: &str,
    chromosome: &str,
    start_bp: u64,
    stop_bp: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + subset_name.len() + chromosome.len());
    buf.extend_from_slice(b"seg:");
    buf.write_u32::<LittleEndian>(dataset_fingerprint).unwrap();
    write_len_prefixed(&mut buf, subset_name.as_bytes());
    write_len_prefixed(&mut buf, chromosome.as_bytes());
    buf.write_u64::<LittleEndian>(start_bp).unwrap();
    buf.write_u64::<LittleEndian>(stop_bp).unwrap();
    buf
}

/// Cache key for a cell: dataset fingerprint, subset name, chromosome,
/// statistic-kind byte, Z code of the (i_start_bp, j_start_bp) pair.
pub fn cell_key(
    dataset_fingerprint: u32,
    subset_name: &str,
    chromosome: &str,
    kind: StatKind,
    z_code: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + subset_name.len() + chromosome.len());
    buf.extend_from_slice(b"cel:");
    buf.write_u32::<LittleEndian>(dataset_fingerprint).unwrap();
    write_len_prefixed(&mut buf, subset_name.as_bytes());
    write_len_prefixed(&mut buf, chromosome.as_bytes());
    buf.push(kind.as_byte());
    buf.write_u64::<LittleEndian>(z_code).unwrap();
    buf
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
    buf.extend_from_slice(bytes);
}

/// RocksDB-backed [`Cache`], one column family holding both segment and
/// cell blobs (they're disambiguated by the `seg:`/`cel:` key prefix).
pub struct RocksDbCache {
    db: Arc<rocksdb::DBWithThreadMode<rocksdb::MultiThreaded>>,
}

impl RocksDbCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DBWithThreadMode::<rocksdb::MultiThreaded>::open(&opts, path)
            .map_err(|e| Error::IoFailure(format!("opening cache database: {e}")))?;
        Ok(RocksDbCache { db: Arc::new(db) })
    }
}

impl Cache for RocksDbCache {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }
}

/// In-memory [`Cache`], used by tests that exercise the caching protocol
/// without standing up RocksDB, and a reasonable choice for embedders who
/// don't need cross-process persistence.
pub struct MemoryCache {
    inner: std::sync::Mutex<std::collections::HashMap<Vec<u8>, Vec<u8>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            inner: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn segment_and_cell_keys_are_distinguishable() {
        let sk = segment_key(0xdead_beef, "all", "22", 100, 199);
        let ck = cell_key(0xdead_beef, "all", "22", StatKind::R, 42);
        assert_ne!(sk, ck);
        assert_eq!(&sk[0..4], b"seg:");
        assert_eq!(&ck[0..4], b"cel:");
    }

    #[test]
    fn cell_key_differs_by_stat_kind() {
        let a = cell_key(1, "all", "22", StatKind::R, 42);
        let b = cell_key(1, "all", "22", StatKind::RSquare, 42);
        assert_ne!(a, b);
    }

    #[test]
    fn memory_cache_round_trips() {
        let cache = MemoryCache::new();
        let key = segment_key(1, "all", "1", 0, 99);
        assert_eq!(cache.get(&key).unwrap(), None);
        cache.set(&key, b"hello").unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rocksdb_cache_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = cell_key(7, "all", "22", StatKind::Cov, 9001);

        {
            let cache = RocksDbCache::open(dir.path()).unwrap();
            assert_eq!(cache.get(&key).unwrap(), None);
            cache.set(&key, b"segment-blob").unwrap();
            assert_eq!(cache.get(&key).unwrap(), Some(b"segment-blob".to_vec()));
        }

        // Reopening against the same path should see the prior writes.
        let reopened = RocksDbCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&key).unwrap(), Some(b"segment-blob".to_vec()));
    }
}
