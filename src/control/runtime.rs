//! Boundary to the consensus runtime that actually runs the shards.
//!
//! The dispatcher only sees [`NodeHost`]; asynchronous operations hand back a
//! [`RequestHandle`] whose channel yields one or more [`IndexState`] values.
//! A runtime (or a test double) creates the pair with
//! [`RequestHandle::channel`] and reports through the [`RequestNotifier`].

use crate::control::messages::{IndexState, SnapshotOptions};
use crate::shard::{Membership, ShardState};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaKind {
    Standard,
    /// Non-voting; receives replication.
    Observer,
    /// Votes but carries no state machine.
    Witness,
}

/// Immediate rejection of an operation, before any handle exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("shard {0} not found")]
    ShardNotFound(u64),
    #[error("shard {0} already exists")]
    ShardAlreadyExists(u64),
    #[error("replica {replica_id} of shard {shard_id} not found")]
    ReplicaNotFound { shard_id: u64, replica_id: u64 },
    #[error("replica is not the leader of shard {0}")]
    NotLeader(u64),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("system busy")]
    Busy,
    #[error("runtime stopped")]
    Stopped,
    #[error("timed out")]
    Timeout,
    #[error("internal runtime error: {0}")]
    Internal(String),
}

enum Notice {
    Value(IndexState),
    Final(IndexState),
    Failed(RuntimeError),
}

/// What [`RequestHandle::next`] observed before the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    /// An interim value; more may follow.
    Value(IndexState),
    /// The last value of the request.
    Final(IndexState),
    /// The runtime failed the request after accepting it.
    Failed(RuntimeError),
    /// The runtime dropped its notifier without a final value.
    Finished,
    TimedOut,
}

pub struct RequestHandle {
    rx: Receiver<Notice>,
}

impl RequestHandle {
    pub fn channel() -> (RequestNotifier, RequestHandle) {
        let (tx, rx) = mpsc::channel();
        (RequestNotifier { tx }, RequestHandle { rx })
    }

    /// A handle that is already complete with `state`.
    pub fn ready(state: IndexState) -> Self {
        let (notifier, handle) = Self::channel();
        notifier.complete(state);
        handle
    }

    /// Waits for the next event until `deadline`. Abandoning the handle does
    /// not cancel the runtime operation.
    pub fn next(&self, deadline: Instant) -> HandleEvent {
        let wait = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(wait) {
            Ok(Notice::Value(state)) => HandleEvent::Value(state),
            Ok(Notice::Final(state)) => HandleEvent::Final(state),
            Ok(Notice::Failed(err)) => HandleEvent::Failed(err),
            Err(RecvTimeoutError::Timeout) => HandleEvent::TimedOut,
            Err(RecvTimeoutError::Disconnected) => HandleEvent::Finished,
        }
    }
}

/// Runtime side of a [`RequestHandle`]. Sends are ignored once the waiter has
/// gone away.
pub struct RequestNotifier {
    tx: Sender<Notice>,
}

impl RequestNotifier {
    /// Publishes an interim value; returns `false` if nobody is waiting.
    pub fn notify(&self, state: IndexState) -> bool {
        self.tx.send(Notice::Value(state)).is_ok()
    }

    pub fn complete(self, state: IndexState) {
        let _ = self.tx.send(Notice::Final(state));
    }

    pub fn fail(self, err: RuntimeError) {
        let _ = self.tx.send(Notice::Failed(err));
    }
}

/// Node-level operations the control plane drives.
pub trait NodeHost: Send + Sync {
    /// Identity of this node host.
    fn id(&self) -> String;

    fn request_add_replica(
        &self,
        kind: ReplicaKind,
        shard_id: u64,
        replica_id: u64,
        target: &str,
        config_change_index: u64,
        timeout: Duration,
    ) -> Result<RequestHandle, RuntimeError>;

    fn request_delete_replica(
        &self,
        shard_id: u64,
        replica_id: u64,
        config_change_index: u64,
        timeout: Duration,
    ) -> Result<RequestHandle, RuntimeError>;

    fn read_index(&self, shard_id: u64, timeout: Duration) -> Result<RequestHandle, RuntimeError>;

    fn request_compaction(
        &self,
        shard_id: u64,
        replica_id: u64,
    ) -> Result<RequestHandle, RuntimeError>;

    fn request_snapshot(
        &self,
        shard_id: u64,
        options: &SnapshotOptions,
        timeout: Duration,
    ) -> Result<RequestHandle, RuntimeError>;

    fn request_leader_transfer(
        &self,
        shard_id: u64,
        target_replica_id: u64,
    ) -> Result<(), RuntimeError>;

    /// `Ok(None)` while the shard has no known leader.
    fn get_leader_id(&self, shard_id: u64) -> Result<Option<u64>, RuntimeError>;

    fn stop_replica(&self, shard_id: u64, replica_id: u64) -> Result<(), RuntimeError>;

    fn stop(&self) -> Result<(), RuntimeError>;

    /// Starts (or joins with) the replica described by `state`.
    fn start_replica(
        &self,
        state: &ShardState,
        join: bool,
        timeout: Duration,
    ) -> Result<(), RuntimeError>;

    fn shard_membership(&self, shard_id: u64, timeout: Duration)
        -> Result<Membership, RuntimeError>;

    /// Removes the runtime's data for a stopped replica.
    fn remove_data(&self, shard_id: u64, replica_id: u64) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::messages::ResultCode;

    #[test]
    fn dropped_notifier_finishes_the_handle() {
        let (notifier, handle) = RequestHandle::channel();
        assert!(notifier.notify(IndexState::new(ResultCode::Completed)));
        drop(notifier);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            handle.next(deadline),
            HandleEvent::Value(IndexState::new(ResultCode::Completed))
        );
        assert_eq!(handle.next(deadline), HandleEvent::Finished);
    }

    #[test]
    fn passed_deadline_times_out_immediately() {
        let (_notifier, handle) = RequestHandle::channel();
        assert_eq!(handle.next(Instant::now()), HandleEvent::TimedOut);
    }
}
