//! Persisted shard configuration, kept apart from state machine data.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// State machine implementation a shard runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMachineKind {
    Test,
    Kv,
}

impl StateMachineKind {
    pub fn code(self) -> u8 {
        match self {
            StateMachineKind::Test => 0,
            StateMachineKind::Kv => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StateMachineKind::Test),
            1 => Some(StateMachineKind::Kv),
            _ => None,
        }
    }
}

/// Shard membership as reported by the consensus runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub config_change_id: u64,
    #[serde(default)]
    pub replicas: BTreeMap<u64, String>,
    #[serde(default)]
    pub observers: BTreeMap<u64, String>,
    #[serde(default)]
    pub witnesses: BTreeMap<u64, String>,
    #[serde(default)]
    pub removed: BTreeSet<u64>,
}

impl Membership {
    pub fn single(replica_id: u64, target: impl Into<String>) -> Self {
        let mut replicas = BTreeMap::new();
        replicas.insert(replica_id, target.into());
        Self {
            replicas,
            ..Self::default()
        }
    }

    pub fn contains(&self, replica_id: u64) -> bool {
        self.replicas.contains_key(&replica_id)
            || self.observers.contains_key(&replica_id)
            || self.witnesses.contains_key(&replica_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard_id: u64,
    pub replica_id: u64,
    pub kind: StateMachineKind,
    pub hostname: String,
    /// Whether the local replica joined an existing shard rather than
    /// bootstrapping it.
    #[serde(default)]
    pub join: bool,
    #[serde(default)]
    pub members: Membership,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl ShardState {
    pub fn bootstrap(
        shard_id: u64,
        replica_id: u64,
        kind: StateMachineKind,
        hostname: impl Into<String>,
    ) -> Self {
        let hostname = hostname.into();
        let now = now_ms();
        Self {
            shard_id,
            replica_id,
            kind,
            members: Membership::single(replica_id, hostname.clone()),
            hostname,
            join: false,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum ShardStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("shard state file {path} holds shard {found}, expected {expected}")]
    Mismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
}

/// JSON files under `<root>/shard-<id>.json`, one per shard hosted here.
#[derive(Debug, Clone)]
pub struct ShardStateStore {
    root: PathBuf,
}

impl ShardStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, shard_id: u64) -> PathBuf {
        self.root.join(format!("shard-{shard_id}.json"))
    }

    pub fn load(&self, shard_id: u64) -> Result<Option<ShardState>, ShardStoreError> {
        let path = self.path_for(shard_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: ShardState = serde_json::from_slice(&bytes)?;
        if state.shard_id != shard_id {
            return Err(ShardStoreError::Mismatch {
                path,
                expected: shard_id,
                found: state.shard_id,
            });
        }
        Ok(Some(state))
    }

    pub fn save(&self, state: &ShardState) -> Result<(), ShardStoreError> {
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(state.shard_id);
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        let payload = serde_json::to_vec_pretty(state)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(tmp, &path)?;
        debug!(
            "event=shard_state_persisted shard_id={} replica_id={} path={}",
            state.shard_id,
            state.replica_id,
            path.display()
        );
        Ok(())
    }

    /// Replaces the persisted membership. Returns `false` when no state exists
    /// for the shard.
    pub fn update_members(
        &self,
        shard_id: u64,
        members: Membership,
    ) -> Result<bool, ShardStoreError> {
        let Some(mut state) = self.load(shard_id)? else {
            return Ok(false);
        };
        if state.members == members {
            return Ok(true);
        }
        state.members = members;
        state.updated_at_ms = now_ms();
        self.save(&state)?;
        Ok(true)
    }

    /// Deletes the shard's state. Returns `false` if nothing was stored.
    pub fn remove(&self, shard_id: u64) -> Result<bool, ShardStoreError> {
        match fs::remove_file(self.path_for(shard_id)) {
            Ok(()) => {
                info!("event=shard_state_removed shard_id={shard_id}");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// All persisted shards ordered by id.
    pub fn list(&self) -> Result<Vec<ShardState>, ShardStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|name| name.strip_prefix("shard-"))
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };
            if let Some(state) = self.load(id)? {
                shards.push(state);
            }
        }
        shards.sort_by_key(|state| state.shard_id);
        Ok(shards)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
