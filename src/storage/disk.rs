//! Write-ahead-log backed store.
//!
//! Every [`WriteBatch`] is appended as one checksummed, length-prefixed
//! record and flushed before it is applied to the in-memory index. Reopening
//! replays the log; a torn or corrupt tail is truncated away so a crash
//! mid-append never poisons the store. The log is rewritten from the live
//! index once enough records accumulate.

use super::{BatchOp, Store, StoreError, WriteBatch};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use twox_hash::XxHash64;

const WAL_FILE: &str = "courier.wal";
const COMPACT_FILE: &str = "courier.wal.compact";

/// Record header: u32 payload length + u64 payload checksum, big-endian.
const HEADER_LEN: usize = 12;

/// Upper bound on a single record; anything larger is a torn tail.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DiskStoreOptions {
    /// Flush to stable storage after every batch.
    pub fsync: bool,
    /// Rewrite the log from the live index after this many records.
    pub compact_after_records: u64,
}

impl Default for DiskStoreOptions {
    fn default() -> Self {
        DiskStoreOptions {
            fsync: true,
            compact_after_records: 4096,
        }
    }
}

pub struct DiskStore {
    dir: PathBuf,
    opts: DiskStoreOptions,
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    index: BTreeMap<String, Vec<u8>>,
    file: File,
    records: u64,
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn apply_to_index(index: &mut BTreeMap<String, Vec<u8>>, batch: WriteBatch) {
    for op in batch.ops {
        match op {
            BatchOp::Put { key, value } => {
                index.insert(key, value);
            }
            BatchOp::Delete { key } => {
                index.remove(&key);
            }
        }
    }
}

impl DiskStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<DiskStore, StoreError> {
        Self::open_with(dir, DiskStoreOptions::default())
    }

    pub fn open_with(
        dir: impl AsRef<Path>,
        opts: DiskStoreOptions,
    ) -> Result<DiskStore, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(WAL_FILE);

        let data = if path.exists() {
            fs::read(&path)?
        } else {
            Vec::new()
        };

        let mut index = BTreeMap::new();
        let mut offset = 0usize;
        let mut records = 0u64;
        while data.len() - offset >= HEADER_LEN {
            let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            let sum = u64::from_be_bytes(data[offset + 4..offset + 12].try_into().unwrap());
            if len > MAX_RECORD_SIZE || data.len() - offset - HEADER_LEN < len {
                break;
            }
            let payload = &data[offset + HEADER_LEN..offset + HEADER_LEN + len];
            if checksum(payload) != sum {
                break;
            }
            let batch: WriteBatch = match serde_json::from_slice(payload) {
                Ok(batch) => batch,
                Err(_) => break,
            };
            apply_to_index(&mut index, batch);
            offset += HEADER_LEN + len;
            records += 1;
        }

        if offset < data.len() {
            warn!(
                dropped_bytes = data.len() - offset,
                path = %path.display(),
                "truncating torn write-ahead tail"
            );
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(offset as u64)?;
        file.seek(SeekFrom::End(0))?;

        let store = DiskStore {
            dir,
            opts,
            inner: Mutex::new(DiskInner {
                index,
                file,
                records,
            }),
        };
        if records >= store.opts.compact_after_records {
            store.compact()?;
        }
        Ok(store)
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    /// Rewrite the log as a single record holding the live index.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut DiskInner) -> Result<(), StoreError> {
        let tmp = self.dir.join(COMPACT_FILE);
        let mut batch = WriteBatch::new();
        for (key, value) in &inner.index {
            batch.put(key.clone(), value.clone());
        }

        {
            let mut file = File::create(&tmp)?;
            if !batch.is_empty() {
                let payload =
                    serde_json::to_vec(&batch).expect("batch encoding is infallible");
                file.write_all(&(payload.len() as u32).to_be_bytes())?;
                file.write_all(&checksum(&payload).to_be_bytes())?;
                file.write_all(&payload)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, self.wal_path())?;

        let mut file = OpenOptions::new().read(true).write(true).open(self.wal_path())?;
        file.seek(SeekFrom::End(0))?;
        inner.file = file;
        inner.records = u64::from(!batch.is_empty());
        debug!(keys = batch.len(), path = %self.wal_path().display(), "compacted store");
        Ok(())
    }

    /// Number of live keys, for tests.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }
}

impl Store for DiskStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.lock().index.get(key).cloned())
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(&batch).expect("batch encoding is infallible");

        let mut inner = self.inner.lock();
        inner.file.write_all(&(payload.len() as u32).to_be_bytes())?;
        inner.file.write_all(&checksum(&payload).to_be_bytes())?;
        inner.file.write_all(&payload)?;
        if self.opts.fsync {
            inner.file.sync_data()?;
        }
        apply_to_index(&mut inner.index, batch);
        inner.records += 1;
        if inner.records >= self.opts.compact_after_records {
            self.compact_locked(&mut inner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_opts() -> DiskStoreOptions {
        DiskStoreOptions {
            fsync: false,
            ..Default::default()
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open_with(dir.path(), fast_opts()).unwrap();
            store.put("a", b"1".to_vec()).unwrap();
            store.put("b", b"2".to_vec()).unwrap();
            store.delete("a").unwrap();
        }
        let store = DiskStore::open_with(dir.path(), fast_opts()).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open_with(dir.path(), fast_opts()).unwrap();
            store.put("k", b"v".to_vec()).unwrap();
        }
        // Simulate a crash mid-append.
        let path = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        drop(file);

        let store = DiskStore::open_with(dir.path(), fast_opts()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));

        // The tail was cut: a clean reopen sees the same single record.
        drop(store);
        let store = DiskStore::open_with(dir.path(), fast_opts()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn compaction_drops_dead_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open_with(dir.path(), fast_opts()).unwrap();
        for i in 0..50 {
            store.put("hot", format!("{i}").into_bytes()).unwrap();
        }
        let before = fs::metadata(dir.path().join(WAL_FILE)).unwrap().len();
        store.compact().unwrap();
        let after = fs::metadata(dir.path().join(WAL_FILE)).unwrap().len();
        assert!(after < before);
        assert_eq!(store.get("hot").unwrap(), Some(b"49".to_vec()));
    }

    #[test]
    fn auto_compacts_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open_with(
            dir.path(),
            DiskStoreOptions {
                fsync: false,
                compact_after_records: 8,
            },
        )
        .unwrap();
        for i in 0..20 {
            store.put("k", format!("{i}").into_bytes()).unwrap();
        }
        assert_eq!(store.get("k").unwrap(), Some(b"19".to_vec()));
        assert!(store.inner.lock().records < 8);
    }
}
