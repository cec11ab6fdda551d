//! Control plane: typed requests over the frame protocol, the dispatcher that
//! serves them against a consensus runtime, and the matching client.

pub mod client;
pub mod dispatcher;
pub mod messages;
pub mod runtime;

pub use client::{ClientError, ControlClient};
pub use dispatcher::{error_domain, ControlDispatcher, DispatchError, ServeSummary};
pub use messages::{
    timeout_from_ms, CompactionRequest, DbError, DeleteReplicaRequest, Empty, ErrorDomain,
    IdResponse, IndexState, LeaderResponse, LeaderTransferRequest, ModifyReplicaRequest,
    NewShardRequest, RaftClusterMethod, RaftControlMethod, ReadIndexRequest, ReplicaRequest,
    ResultCode, ShardMembersResponse, ShardRequest, SnapshotOptions, SnapshotRequest,
    StartReplicaRequest,
};
pub use runtime::{
    HandleEvent, NodeHost, ReplicaKind, RequestHandle, RequestNotifier, RuntimeError,
};
