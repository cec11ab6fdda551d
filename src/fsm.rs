//! Data plane: the replicated key-value state machine and its storage.

pub mod command;
pub mod key;
pub mod machine;
pub mod snapshot;
pub mod store;

pub use command::{ApplyOutcome, KvCommand, LookupQuery, LookupResult};
pub use key::{KeyError, KeyPath, ResourceName, MAX_KEY_DEPTH, MAX_KEY_LEN, MIN_KEY_SEGMENTS};
pub use machine::{
    Entry, FsmError, KvStateMachine, OnDiskStateMachine, SmResult, SnapshotContext,
};
pub use snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};
pub use store::{BucketStore, StoreError, WriteTxn};
