//! Nested-bucket key space on top of RocksDB.
//!
//! Key layout (path segments are NUL-terminated, which is unambiguous because
//! keys never contain NUL):
//!
//! * `0x00 name`          internal metadata, e.g. the applied index
//! * `0x01 seg\0 seg\0..` bucket marker, one per existing bucket
//! * `0x02 seg\0.. leaf`  value stored under `leaf` in the innermost bucket

use crate::fsm::key::KeyPath;
use log::debug;
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{IteratorMode, Options, ReadOptions, WriteBatch, DB};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUCKET_PREFIX: u8 = 0x01;
const VALUE_PREFIX: u8 = 0x02;
const APPLIED_INDEX_KEY: &[u8] = b"\x00applied_index";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("stored applied index has {len} bytes, expected 8")]
    CorruptIndex { len: usize },
}

pub struct BucketStore {
    db: DB,
    path: PathBuf,
}

impl BucketStore {
    /// Opens the store at `path`, creating it and its parent directories if
    /// absent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        debug!("event=bucket_store_opened path={}", path.display());
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let opts = Options::default();
        let db = DB::open_for_read_only(&opts, path, false)?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Removes every file of the store at `path`. Missing stores are fine.
    pub fn destroy(path: &Path) -> Result<(), StoreError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn applied_index(&self) -> Result<u64, StoreError> {
        decode_index(self.db.get(APPLIED_INDEX_KEY)?)
    }

    pub fn get(&self, key: &KeyPath) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(value_key(key))?)
    }

    pub fn bucket_exists(&self, buckets: &[String]) -> Result<bool, StoreError> {
        Ok(self.db.get(bucket_key(buckets))?.is_some())
    }

    pub fn begin(&self) -> WriteTxn<'_> {
        WriteTxn {
            store: self,
            batch: WriteBatch::default(),
            created: HashSet::new(),
            staged: HashMap::new(),
        }
    }

    /// Visits every raw record from one consistent point-in-time view.
    pub fn scan<E, F>(&self, mut visit: F) -> Result<u64, E>
    where
        E: From<StoreError>,
        F: FnMut(&[u8], &[u8]) -> Result<(), E>,
    {
        let snapshot = self.db.snapshot();
        let mut opts = ReadOptions::default();
        opts.set_snapshot(&snapshot);
        let mut visited = 0;
        for item in self.db.iterator_opt(IteratorMode::Start, opts) {
            let (key, value) = item.map_err(StoreError::from)?;
            visit(&key, &value)?;
            visited += 1;
        }
        Ok(visited)
    }

    /// Writes raw records as produced by [`BucketStore::scan`].
    pub fn ingest(&self, records: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for (key, value) in records {
            batch.put(key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Hard-links a point-in-time copy of the store into `dir`, which must
    /// not exist yet.
    pub fn checkpoint(&self, dir: &Path) -> Result<(), StoreError> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(dir)?;
        Ok(())
    }

    /// Flushes the write-ahead log to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}

/// Batch of mutations committed atomically with the applied index.
pub struct WriteTxn<'a> {
    store: &'a BucketStore,
    batch: WriteBatch,
    created: HashSet<Vec<u8>>,
    staged: HashMap<Vec<u8>, bool>,
}

impl WriteTxn<'_> {
    /// Creates every missing bucket along `buckets`, outermost first.
    pub fn ensure_buckets(&mut self, buckets: &[String]) -> Result<(), StoreError> {
        for depth in 1..=buckets.len() {
            let marker = bucket_key(&buckets[..depth]);
            if self.created.contains(&marker) {
                continue;
            }
            if self.store.db.get(&marker)?.is_none() {
                self.batch.put(&marker, b"");
            }
            self.created.insert(marker);
        }
        Ok(())
    }

    pub fn put(&mut self, key: &KeyPath, value: &[u8]) -> Result<(), StoreError> {
        self.ensure_buckets(key.buckets())?;
        let raw = value_key(key);
        self.batch.put(&raw, value);
        self.staged.insert(raw, true);
        Ok(())
    }

    /// Deletes `key`; returns whether it was present.
    pub fn delete(&mut self, key: &KeyPath) -> Result<bool, StoreError> {
        let raw = value_key(key);
        let existed = match self.staged.get(&raw) {
            Some(present) => *present,
            None => self.store.db.get(&raw)?.is_some(),
        };
        if existed {
            self.batch.delete(&raw);
        }
        self.staged.insert(raw, false);
        Ok(existed)
    }

    pub fn set_applied_index(&mut self, index: u64) {
        self.batch.put(APPLIED_INDEX_KEY, index.to_le_bytes());
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.store.db.write(self.batch)?;
        Ok(())
    }
}

fn decode_index(raw: Option<Vec<u8>>) -> Result<u64, StoreError> {
    match raw {
        None => Ok(0),
        Some(bytes) => {
            let array: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::CorruptIndex { len: bytes.len() })?;
            Ok(u64::from_le_bytes(array))
        }
    }
}

fn push_segments(buf: &mut Vec<u8>, segments: &[String]) {
    for segment in segments {
        buf.extend_from_slice(segment.as_bytes());
        buf.push(0);
    }
}

fn bucket_key(buckets: &[String]) -> Vec<u8> {
    let mut key = vec![BUCKET_PREFIX];
    push_segments(&mut key, buckets);
    key
}

fn value_key(path: &KeyPath) -> Vec<u8> {
    let mut key = vec![VALUE_PREFIX];
    push_segments(&mut key, path.buckets());
    key.extend_from_slice(path.leaf().as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_keys_do_not_collide_across_depths() {
        let shallow = KeyPath::parse("/a/b/c/d/ef").unwrap();
        let deep = KeyPath::parse("/a/b/c/d/e/f").unwrap();
        assert_ne!(value_key(&shallow), value_key(&deep));
    }

    #[test]
    fn put_creates_enclosing_buckets_in_one_batch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = BucketStore::open(&tmp.path().join("store.db")).unwrap();
        let key = KeyPath::parse("/a/b/c/d/leaf").unwrap();
        let outer = vec!["a".to_string(), "b".to_string()];
        assert!(!store.bucket_exists(&outer).unwrap());

        let mut txn = store.begin();
        txn.put(&key, b"v").unwrap();
        txn.set_applied_index(1);
        assert!(!store.bucket_exists(&outer).unwrap());
        txn.commit().unwrap();

        assert!(store.bucket_exists(&outer).unwrap());
        assert!(store.bucket_exists(key.buckets()).unwrap());
        assert!(!store.bucket_exists(&["z".to_string()]).unwrap());
        assert_eq!(store.get(&key).unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.applied_index().unwrap(), 1);
    }

    #[test]
    fn missing_index_reads_as_zero() {
        assert_eq!(decode_index(None).unwrap(), 0);
        assert!(matches!(
            decode_index(Some(vec![1, 2, 3])),
            Err(StoreError::CorruptIndex { len: 3 })
        ));
    }
}
