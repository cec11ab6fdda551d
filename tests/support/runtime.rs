#![allow(dead_code)]

use parking_lot::Mutex;
use shardfabric::control::{
    IndexState, NodeHost, ReplicaKind, RequestHandle, RequestNotifier, RuntimeError,
    SnapshotOptions,
};
use shardfabric::{Membership, ShardState};
use std::time::Duration;

/// How the stub answers the next asynchronous request.
#[derive(Debug, Clone)]
pub enum Script {
    /// Every value but the last is interim; the last completes the request.
    Complete(Vec<IndexState>),
    /// Publishes the values, then fails the request.
    Fail(Vec<IndexState>, RuntimeError),
    /// Accepts the request and never answers.
    Hang,
    /// Refuses the request at submission.
    Reject(RuntimeError),
}

/// Scripted [`NodeHost`] that records every call it receives.
pub struct StubHost {
    id: String,
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    pending: Mutex<Vec<RequestNotifier>>,
    leader: Mutex<Option<u64>>,
    members: Mutex<Membership>,
    started: Mutex<Vec<(u64, u64, bool)>>,
    sync_error: Mutex<Option<RuntimeError>>,
}

impl StubHost {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(Script::Complete(Vec::new())),
            calls: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            leader: Mutex::new(None),
            members: Mutex::new(Membership::default()),
            started: Mutex::new(Vec::new()),
            sync_error: Mutex::new(None),
        }
    }

    pub fn script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn set_leader(&self, leader: Option<u64>) {
        *self.leader.lock() = leader;
    }

    pub fn set_members(&self, members: Membership) {
        *self.members.lock() = members;
    }

    /// Fails every synchronous operation with `err` until cleared.
    pub fn fail_sync(&self, err: Option<RuntimeError>) {
        *self.sync_error.lock() = err;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn started(&self) -> Vec<(u64, u64, bool)> {
        self.started.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn sync_result(&self) -> Result<(), RuntimeError> {
        match self.sync_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn submit(&self) -> Result<RequestHandle, RuntimeError> {
        let script = self.script.lock().clone();
        match script {
            Script::Reject(err) => Err(err),
            Script::Hang => {
                let (notifier, handle) = RequestHandle::channel();
                self.pending.lock().push(notifier);
                Ok(handle)
            }
            Script::Complete(mut values) => {
                let (notifier, handle) = RequestHandle::channel();
                let last = values.pop();
                for value in values {
                    notifier.notify(value);
                }
                if let Some(last) = last {
                    notifier.complete(last);
                }
                Ok(handle)
            }
            Script::Fail(values, err) => {
                let (notifier, handle) = RequestHandle::channel();
                for value in values {
                    notifier.notify(value);
                }
                notifier.fail(err);
                Ok(handle)
            }
        }
    }
}

impl NodeHost for StubHost {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn request_add_replica(
        &self,
        kind: ReplicaKind,
        shard_id: u64,
        replica_id: u64,
        target: &str,
        config_change_index: u64,
        timeout: Duration,
    ) -> Result<RequestHandle, RuntimeError> {
        self.record(format!(
            "add {kind:?} {shard_id} {replica_id} {target} {config_change_index} {}",
            timeout.as_millis()
        ));
        self.submit()
    }

    fn request_delete_replica(
        &self,
        shard_id: u64,
        replica_id: u64,
        config_change_index: u64,
        timeout: Duration,
    ) -> Result<RequestHandle, RuntimeError> {
        self.record(format!(
            "delete {shard_id} {replica_id} {config_change_index} {}",
            timeout.as_millis()
        ));
        self.submit()
    }

    fn read_index(&self, shard_id: u64, timeout: Duration) -> Result<RequestHandle, RuntimeError> {
        self.record(format!("read_index {shard_id} {}", timeout.as_millis()));
        self.submit()
    }

    fn request_compaction(
        &self,
        shard_id: u64,
        replica_id: u64,
    ) -> Result<RequestHandle, RuntimeError> {
        self.record(format!("compaction {shard_id} {replica_id}"));
        self.submit()
    }

    fn request_snapshot(
        &self,
        shard_id: u64,
        options: &SnapshotOptions,
        timeout: Duration,
    ) -> Result<RequestHandle, RuntimeError> {
        self.record(format!(
            "snapshot {shard_id} {} {}",
            options.export_path,
            timeout.as_millis()
        ));
        self.submit()
    }

    fn request_leader_transfer(
        &self,
        shard_id: u64,
        target_replica_id: u64,
    ) -> Result<(), RuntimeError> {
        self.record(format!("leader_transfer {shard_id} {target_replica_id}"));
        self.sync_result()
    }

    fn get_leader_id(&self, shard_id: u64) -> Result<Option<u64>, RuntimeError> {
        self.record(format!("leader {shard_id}"));
        self.sync_result()?;
        Ok(*self.leader.lock())
    }

    fn stop_replica(&self, shard_id: u64, replica_id: u64) -> Result<(), RuntimeError> {
        self.record(format!("stop_replica {shard_id} {replica_id}"));
        self.sync_result()
    }

    fn stop(&self) -> Result<(), RuntimeError> {
        self.record("stop".to_string());
        self.sync_result()
    }

    fn start_replica(
        &self,
        state: &ShardState,
        join: bool,
        _timeout: Duration,
    ) -> Result<(), RuntimeError> {
        self.record(format!(
            "start_replica {} {} {join}",
            state.shard_id, state.replica_id
        ));
        self.sync_result()?;
        self.started
            .lock()
            .push((state.shard_id, state.replica_id, join));
        Ok(())
    }

    fn shard_membership(
        &self,
        shard_id: u64,
        _timeout: Duration,
    ) -> Result<Membership, RuntimeError> {
        self.record(format!("membership {shard_id}"));
        self.sync_result()?;
        Ok(self.members.lock().clone())
    }

    fn remove_data(&self, shard_id: u64, replica_id: u64) -> Result<(), RuntimeError> {
        self.record(format!("remove_data {shard_id} {replica_id}"));
        self.sync_result()
    }
}
