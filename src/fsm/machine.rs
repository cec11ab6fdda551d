use crate::config::NodeConfig;
use crate::fsm::command::{ApplyOutcome, KvCommand, LookupQuery, LookupResult};
use crate::fsm::key::{KeyError, KeyPath};
use crate::fsm::snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};
use crate::fsm::store::{BucketStore, StoreError, WriteTxn};
use crate::wire::{MessageError, WireMessage};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

const RECOVERY_BATCH: usize = 1024;

/// Result reported back to the runtime for one applied entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmResult {
    pub value: u64,
    pub data: Vec<u8>,
}

/// A committed log entry handed to `update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub cmd: Vec<u8>,
    pub result: SmResult,
}

impl Entry {
    pub fn new(index: u64, cmd: Vec<u8>) -> Self {
        Self {
            index,
            cmd,
            result: SmResult::default(),
        }
    }

    pub fn outcome(&self) -> Option<ApplyOutcome> {
        ApplyOutcome::decode(&self.result.data).ok()
    }
}

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("state machine is closed")]
    Closed,
    #[error("state machine halted after a fatal error; recover from a snapshot")]
    Halted,
    #[error("open stopped before the store was ready")]
    OpenStopped,
    #[error("snapshot operation stopped")]
    SnapshotStopped,
    #[error("entry index {index} does not advance applied index {applied}")]
    IndexRegression { index: u64, applied: u64 },
    #[error("applied index is {stored} after batch ending at {expected}")]
    ApplyIntegrity { expected: u64, stored: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsmError {
    /// Errors after which the replica must stop applying entries.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FsmError::Halted
                | FsmError::IndexRegression { .. }
                | FsmError::ApplyIntegrity { .. }
                | FsmError::Store(_)
        )
    }
}

/// Point-in-time copy taken by `prepare_snapshot`; removed once saved or
/// dropped.
#[derive(Debug)]
pub struct SnapshotContext {
    applied_index: u64,
    dir: PathBuf,
}

impl SnapshotContext {
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for SnapshotContext {
    fn drop(&mut self) {
        if let Err(err) = BucketStore::destroy(&self.dir) {
            warn!(
                "event=snapshot_checkpoint_cleanup_failed dir={} error={err}",
                self.dir.display()
            );
        }
    }
}

/// Contract between the consensus runtime and a disk-backed state machine.
///
/// The runtime serializes `update` calls for one replica; `lookup` may run
/// concurrently with them and never observes a partially applied batch.
pub trait OnDiskStateMachine: Send + Sync {
    /// Opens or creates the store and returns the last applied index.
    fn open(&self, stop: &AtomicBool) -> Result<u64, FsmError>;

    /// Applies committed entries in order, filling each entry's result.
    fn update(&self, entries: Vec<Entry>) -> Result<Vec<Entry>, FsmError>;

    fn lookup(&self, query: &LookupQuery) -> Result<LookupResult, FsmError>;

    fn sync(&self) -> Result<(), FsmError>;

    fn prepare_snapshot(&self) -> Result<SnapshotContext, FsmError>;

    fn save_snapshot(
        &self,
        ctx: SnapshotContext,
        writer: &mut dyn Write,
        stop: &AtomicBool,
    ) -> Result<u64, FsmError>;

    fn recover_from_snapshot(&self, reader: &mut dyn Read, stop: &AtomicBool)
        -> Result<(), FsmError>;

    fn close(&self) -> Result<(), FsmError>;
}

/// Key-value state machine over a [`BucketStore`].
pub struct KvStateMachine {
    shard_id: u64,
    replica_id: u64,
    path: PathBuf,
    store: RwLock<Option<BucketStore>>,
    halted: AtomicBool,
    checkpoints: AtomicU64,
}

impl KvStateMachine {
    pub fn new(shard_id: u64, replica_id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            shard_id,
            replica_id,
            path: path.into(),
            store: RwLock::new(None),
            halted: AtomicBool::new(false),
            checkpoints: AtomicU64::new(0),
        }
    }

    pub fn for_replica(config: &NodeConfig, shard_id: u64, replica_id: u64) -> Self {
        Self::new(shard_id, replica_id, config.store_path(shard_id, replica_id))
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<(), FsmError> {
        if self.is_halted() {
            return Err(FsmError::Halted);
        }
        Ok(())
    }

    fn halt(&self, err: &FsmError) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!(
                "event=state_machine_halted shard_id={} replica_id={} error={err}",
                self.shard_id, self.replica_id
            );
        }
    }

    fn apply_batch(store: &BucketStore, entries: &mut [Entry]) -> Result<u64, FsmError> {
        let mut applied = store.applied_index()?;
        let mut txn = store.begin();
        for entry in entries.iter_mut() {
            if entry.index <= applied {
                return Err(FsmError::IndexRegression {
                    index: entry.index,
                    applied,
                });
            }
            let outcome = Self::apply_entry(&mut txn, entry)?;
            entry.result = SmResult {
                value: match &outcome {
                    ApplyOutcome::Written { bytes } => *bytes,
                    _ => 0,
                },
                data: outcome.encode()?,
            };
            txn.set_applied_index(entry.index);
            applied = entry.index;
        }
        txn.commit()?;
        Ok(applied)
    }

    /// Invalid commands and keys are rejected identically on every replica
    /// and do not fail the batch.
    fn apply_entry(txn: &mut WriteTxn<'_>, entry: &Entry) -> Result<ApplyOutcome, FsmError> {
        let command = match KvCommand::decode(&entry.cmd) {
            Ok(command) => command,
            Err(err) => {
                warn!("event=entry_rejected index={} error={err}", entry.index);
                return Ok(ApplyOutcome::Rejected {
                    reason: err.to_string(),
                });
            }
        };
        let path = match KeyPath::parse(command.key()) {
            Ok(path) => path,
            Err(err) => {
                warn!(
                    "event=entry_rejected index={} key={} error={err}",
                    entry.index,
                    command.key()
                );
                return Ok(ApplyOutcome::Rejected {
                    reason: err.to_string(),
                });
            }
        };
        match command {
            KvCommand::Put { value, .. } => {
                txn.put(&path, &value)?;
                Ok(ApplyOutcome::Written {
                    bytes: value.len() as u64,
                })
            }
            KvCommand::Delete { .. } => {
                let existed = txn.delete(&path)?;
                Ok(ApplyOutcome::Deleted { existed })
            }
        }
    }

    fn rebuild(
        &self,
        staging: &Path,
        reader: &mut dyn Read,
        stop: &AtomicBool,
    ) -> Result<u64, FsmError> {
        let store = BucketStore::open(staging)?;
        let mut snapshot = SnapshotReader::new(reader)?;
        let mut batch = Vec::with_capacity(RECOVERY_BATCH);
        while let Some(record) = snapshot.next_record()? {
            if stop.load(Ordering::Relaxed) {
                return Err(FsmError::SnapshotStopped);
            }
            batch.push(record);
            if batch.len() >= RECOVERY_BATCH {
                store.ingest(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            store.ingest(&batch)?;
        }
        store.sync()?;
        Ok(store.applied_index()?)
    }

    fn checkpoint_dir(&self, applied_index: u64) -> PathBuf {
        let seq = self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_extension("checkpoints")
            .join(format!("prepare-{applied_index}-{seq}"))
    }
}

impl OnDiskStateMachine for KvStateMachine {
    fn open(&self, stop: &AtomicBool) -> Result<u64, FsmError> {
        let mut guard = self.store.write();
        if let Some(store) = guard.as_ref() {
            return Ok(store.applied_index()?);
        }
        if stop.load(Ordering::Relaxed) {
            return Err(FsmError::OpenStopped);
        }
        let store = BucketStore::open(&self.path)?;
        let applied = store.applied_index()?;
        *guard = Some(store);
        info!(
            "event=state_machine_opened shard_id={} replica_id={} applied_index={} path={}",
            self.shard_id,
            self.replica_id,
            applied,
            self.path.display()
        );
        Ok(applied)
    }

    fn update(&self, mut entries: Vec<Entry>) -> Result<Vec<Entry>, FsmError> {
        self.check_running()?;
        let guard = self.store.write();
        let store = guard.as_ref().ok_or(FsmError::Closed)?;
        let Some(expected) = entries.last().map(|entry| entry.index) else {
            return Ok(entries);
        };
        let result = Self::apply_batch(store, &mut entries).and_then(|_| {
            let stored = store.applied_index()?;
            if stored != expected {
                return Err(FsmError::ApplyIntegrity { expected, stored });
            }
            Ok(stored)
        });
        match result {
            Ok(applied) => {
                debug!(
                    "event=batch_applied shard_id={} replica_id={} entries={} applied_index={applied}",
                    self.shard_id,
                    self.replica_id,
                    entries.len()
                );
                Ok(entries)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.halt(&err);
                }
                Err(err)
            }
        }
    }

    fn lookup(&self, query: &LookupQuery) -> Result<LookupResult, FsmError> {
        self.check_running()?;
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(FsmError::Closed)?;
        match query {
            LookupQuery::Get { key } => {
                let path = KeyPath::parse(key)?;
                Ok(LookupResult::Value(store.get(&path)?))
            }
            LookupQuery::AppliedIndex => Ok(LookupResult::AppliedIndex(store.applied_index()?)),
        }
    }

    fn sync(&self) -> Result<(), FsmError> {
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(FsmError::Closed)?;
        store.sync()?;
        Ok(())
    }

    fn prepare_snapshot(&self) -> Result<SnapshotContext, FsmError> {
        self.check_running()?;
        let guard = self.store.read();
        let store = guard.as_ref().ok_or(FsmError::Closed)?;
        let applied_index = store.applied_index()?;
        let dir = self.checkpoint_dir(applied_index);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }
        BucketStore::destroy(&dir)?;
        store.checkpoint(&dir)?;
        debug!(
            "event=snapshot_prepared shard_id={} replica_id={} applied_index={applied_index}",
            self.shard_id, self.replica_id
        );
        Ok(SnapshotContext { applied_index, dir })
    }

    fn save_snapshot(
        &self,
        ctx: SnapshotContext,
        writer: &mut dyn Write,
        stop: &AtomicBool,
    ) -> Result<u64, FsmError> {
        self.check_running()?;
        let guard = self.store.read();
        guard.as_ref().ok_or(FsmError::Closed)?;
        let source = BucketStore::open_read_only(ctx.dir())?;
        let mut out = SnapshotWriter::new(writer)?;
        source.scan(|key, value| {
            if stop.load(Ordering::Relaxed) {
                return Err(FsmError::SnapshotStopped);
            }
            out.record(key, value).map_err(FsmError::from)
        })?;
        let records = out.finish()?;
        drop(source);
        info!(
            "event=snapshot_saved shard_id={} replica_id={} applied_index={} records={records}",
            self.shard_id,
            self.replica_id,
            ctx.applied_index()
        );
        Ok(records)
    }

    fn recover_from_snapshot(
        &self,
        reader: &mut dyn Read,
        stop: &AtomicBool,
    ) -> Result<(), FsmError> {
        let mut guard = self.store.write();
        if guard.is_none() {
            return Err(FsmError::Closed);
        }
        let staging = self.path.with_extension("recovering");
        BucketStore::destroy(&staging)?;
        let applied = match self.rebuild(&staging, reader, stop) {
            Ok(applied) => applied,
            Err(err) => {
                if let Err(cleanup) = BucketStore::destroy(&staging) {
                    warn!(
                        "event=snapshot_staging_cleanup_failed path={} error={cleanup}",
                        staging.display()
                    );
                }
                warn!(
                    "event=snapshot_recovery_failed shard_id={} replica_id={} error={err}",
                    self.shard_id, self.replica_id
                );
                return Err(err);
            }
        };
        guard.take();
        BucketStore::destroy(&self.path)?;
        fs::rename(&staging, &self.path)?;
        *guard = Some(BucketStore::open(&self.path)?);
        self.halted.store(false, Ordering::Release);
        info!(
            "event=snapshot_recovered shard_id={} replica_id={} applied_index={applied}",
            self.shard_id, self.replica_id
        );
        Ok(())
    }

    fn close(&self) -> Result<(), FsmError> {
        let mut guard = self.store.write();
        guard.take().ok_or(FsmError::Closed)?;
        info!(
            "event=state_machine_closed shard_id={} replica_id={}",
            self.shard_id, self.replica_id
        );
        Ok(())
    }
}
