use crate::fsm::SmResult;
use crate::shard::{Membership, StateMachineKind};
use crate::wire::{MessageError, PayloadReader, PayloadWriter, WireMessage};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Method bytes of the raft-control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftControlMethod {
    AddReplica,
    AddObserver,
    AddWitness,
    GetId,
    GetLeaderId,
    ReadIndex,
    RequestCompaction,
    RequestDeleteReplica,
    RequestLeaderTransfer,
    RequestSnapshot,
    Stop,
    StopReplica,
}

impl RaftControlMethod {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use RaftControlMethod::*;
        Some(match byte {
            0x01 => AddReplica,
            0x02 => AddObserver,
            0x03 => AddWitness,
            0x04 => GetId,
            0x05 => GetLeaderId,
            0x06 => ReadIndex,
            0x07 => RequestCompaction,
            0x08 => RequestDeleteReplica,
            0x09 => RequestLeaderTransfer,
            0x0A => RequestSnapshot,
            0x0B => Stop,
            0x0C => StopReplica,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        use RaftControlMethod::*;
        match self {
            AddReplica => 0x01,
            AddObserver => 0x02,
            AddWitness => 0x03,
            GetId => 0x04,
            GetLeaderId => 0x05,
            ReadIndex => 0x06,
            RequestCompaction => 0x07,
            RequestDeleteReplica => 0x08,
            RequestLeaderTransfer => 0x09,
            RequestSnapshot => 0x0A,
            Stop => 0x0B,
            StopReplica => 0x0C,
        }
    }

    /// Methods answered with a StreamStart..StreamEnd sequence.
    pub fn is_streamed(self) -> bool {
        use RaftControlMethod::*;
        matches!(
            self,
            AddReplica
                | AddObserver
                | AddWitness
                | ReadIndex
                | RequestCompaction
                | RequestDeleteReplica
                | RequestSnapshot
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftClusterMethod {
    NewShard,
    StartReplica,
    RemoveData,
    GetShardMembers,
}

impl RaftClusterMethod {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(RaftClusterMethod::NewShard),
            0x02 => Some(RaftClusterMethod::StartReplica),
            0x03 => Some(RaftClusterMethod::RemoveData),
            0x04 => Some(RaftClusterMethod::GetShardMembers),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            RaftClusterMethod::NewShard => 0x01,
            RaftClusterMethod::StartReplica => 0x02,
            RaftClusterMethod::RemoveData => 0x03,
            RaftClusterMethod::GetShardMembers => 0x04,
        }
    }
}

/// Terminal classification of a runtime request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Timeout,
    Completed,
    Terminated,
    Rejected,
    Dropped,
    Aborted,
    Committed,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        match self {
            ResultCode::Timeout => 0,
            ResultCode::Completed => 1,
            ResultCode::Terminated => 2,
            ResultCode::Rejected => 3,
            ResultCode::Dropped => 4,
            ResultCode::Aborted => 5,
            ResultCode::Committed => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ResultCode::Timeout,
            1 => ResultCode::Completed,
            2 => ResultCode::Terminated,
            3 => ResultCode::Rejected,
            4 => ResultCode::Dropped,
            5 => ResultCode::Aborted,
            6 => ResultCode::Committed,
            _ => return None,
        })
    }
}

/// Domain tag of a structured error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    Session,
    KeyValue,
    RaftControl,
    RaftCluster,
}

impl ErrorDomain {
    pub fn code(self) -> u8 {
        match self {
            ErrorDomain::Session => 0,
            ErrorDomain::KeyValue => 1,
            ErrorDomain::RaftControl => 2,
            ErrorDomain::RaftCluster => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ErrorDomain::Session),
            1 => Some(ErrorDomain::KeyValue),
            2 => Some(ErrorDomain::RaftControl),
            3 => Some(ErrorDomain::RaftCluster),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub domain: ErrorDomain,
    pub message: String,
}

impl DbError {
    pub fn new(domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self {
            domain,
            message: message.into(),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.domain, self.message)
    }
}

impl std::error::Error for DbError {}

impl WireMessage for DbError {
    const NAME: &'static str = "db_error";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 3 + self.message.len())
            .u8(self.domain.code())
            .string("message", &self.message)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let raw = reader.u8()?;
        let domain = ErrorDomain::from_code(raw).ok_or_else(|| reader.unknown("domain", raw as u64))?;
        let message = reader.string("message")?;
        reader.finish()?;
        Ok(Self { domain, message })
    }
}

/// One value of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexState {
    pub status: ResultCode,
    pub snapshot_index: u64,
    pub result: SmResult,
}

impl IndexState {
    pub fn new(status: ResultCode) -> Self {
        Self {
            status,
            snapshot_index: 0,
            result: SmResult::default(),
        }
    }

    pub fn with_snapshot_index(mut self, index: u64) -> Self {
        self.snapshot_index = index;
        self
    }

    pub fn with_result(mut self, result: SmResult) -> Self {
        self.result = result;
        self
    }
}

impl WireMessage for IndexState {
    const NAME: &'static str = "index_state";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 21 + self.result.data.len())
            .u8(self.status.code())
            .u64(self.snapshot_index)
            .u64(self.result.value)
            .bytes("data", &self.result.data)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let raw = reader.u8()?;
        let status = ResultCode::from_code(raw).ok_or_else(|| reader.unknown("status", raw as u64))?;
        let snapshot_index = reader.u64()?;
        let value = reader.u64()?;
        let data = reader.bytes()?;
        reader.finish()?;
        Ok(Self {
            status,
            snapshot_index,
            result: SmResult { value, data },
        })
    }
}

/// Milliseconds on the wire; zero selects the server's default.
pub fn timeout_from_ms(ms: u64, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(ms)
    }
}

/// Add a replica, observer or witness; the method byte picks which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyReplicaRequest {
    pub shard_id: u64,
    pub replica_id: u64,
    pub target: String,
    pub config_change_index: u64,
    pub timeout_ms: u64,
}

impl WireMessage for ModifyReplicaRequest {
    const NAME: &'static str = "modify_replica_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 34 + self.target.len())
            .u64(self.shard_id)
            .u64(self.replica_id)
            .string("target", &self.target)
            .u64(self.config_change_index)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            replica_id: reader.u64()?,
            target: reader.string("target")?,
            config_change_index: reader.u64()?,
            timeout_ms: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReplicaRequest {
    pub shard_id: u64,
    pub replica_id: u64,
    pub config_change_index: u64,
    pub timeout_ms: u64,
}

impl WireMessage for DeleteReplicaRequest {
    const NAME: &'static str = "delete_replica_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 32)
            .u64(self.shard_id)
            .u64(self.replica_id)
            .u64(self.config_change_index)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            replica_id: reader.u64()?,
            config_change_index: reader.u64()?,
            timeout_ms: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

/// Request or response with no fields beyond the version byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl WireMessage for Empty {
    const NAME: &'static str = "empty";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 0).finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        PayloadReader::versioned(bytes, Self::NAME)?.finish()?;
        Ok(Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdResponse {
    pub id: String,
}

impl WireMessage for IdResponse {
    const NAME: &'static str = "id_response";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 2 + self.id.len())
            .string("id", &self.id)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let id = reader.string("id")?;
        reader.finish()?;
        Ok(Self { id })
    }
}

/// Request carrying only a shard id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRequest {
    pub shard_id: u64,
}

impl WireMessage for ShardRequest {
    const NAME: &'static str = "shard_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 8).u64(self.shard_id).finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let shard_id = reader.u64()?;
        reader.finish()?;
        Ok(Self { shard_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderResponse {
    pub leader_id: u64,
    /// False when the shard currently has no known leader.
    pub available: bool,
}

impl WireMessage for LeaderResponse {
    const NAME: &'static str = "leader_response";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 9)
            .u64(self.leader_id)
            .bool(self.available)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let response = Self {
            leader_id: reader.u64()?,
            available: reader.bool()?,
        };
        reader.finish()?;
        Ok(response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIndexRequest {
    pub shard_id: u64,
    pub timeout_ms: u64,
}

impl WireMessage for ReadIndexRequest {
    const NAME: &'static str = "read_index_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 16)
            .u64(self.shard_id)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            timeout_ms: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionRequest {
    pub shard_id: u64,
    pub replica_id: u64,
    pub timeout_ms: u64,
}

impl WireMessage for CompactionRequest {
    const NAME: &'static str = "compaction_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 24)
            .u64(self.shard_id)
            .u64(self.replica_id)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            replica_id: reader.u64()?,
            timeout_ms: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderTransferRequest {
    pub shard_id: u64,
    pub target_replica_id: u64,
}

impl WireMessage for LeaderTransferRequest {
    const NAME: &'static str = "leader_transfer_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 16)
            .u64(self.shard_id)
            .u64(self.target_replica_id)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            target_replica_id: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub compaction_overhead: u64,
    pub export_path: String,
    pub exported: bool,
    pub override_compaction_overhead: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub shard_id: u64,
    pub options: SnapshotOptions,
    pub timeout_ms: u64,
}

impl WireMessage for SnapshotRequest {
    const NAME: &'static str = "snapshot_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 28 + self.options.export_path.len())
            .u64(self.shard_id)
            .u64(self.options.compaction_overhead)
            .string("export_path", &self.options.export_path)
            .bool(self.options.exported)
            .bool(self.options.override_compaction_overhead)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let shard_id = reader.u64()?;
        let options = SnapshotOptions {
            compaction_overhead: reader.u64()?,
            export_path: reader.string("export_path")?,
            exported: reader.bool()?,
            override_compaction_overhead: reader.bool()?,
        };
        let timeout_ms = reader.u64()?;
        reader.finish()?;
        Ok(Self {
            shard_id,
            options,
            timeout_ms,
        })
    }
}

/// Addresses one replica without further parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaRequest {
    pub shard_id: u64,
    pub replica_id: u64,
}

impl WireMessage for ReplicaRequest {
    const NAME: &'static str = "replica_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 16)
            .u64(self.shard_id)
            .u64(self.replica_id)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            replica_id: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShardRequest {
    pub shard_id: u64,
    pub replica_id: u64,
    pub kind: StateMachineKind,
    pub hostname: String,
    pub timeout_ms: u64,
}

impl WireMessage for NewShardRequest {
    const NAME: &'static str = "new_shard_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 27 + self.hostname.len())
            .u64(self.shard_id)
            .u64(self.replica_id)
            .u8(self.kind.code())
            .string("hostname", &self.hostname)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let shard_id = reader.u64()?;
        let replica_id = reader.u64()?;
        let raw = reader.u8()?;
        let kind =
            StateMachineKind::from_code(raw).ok_or_else(|| reader.unknown("kind", raw as u64))?;
        let hostname = reader.string("hostname")?;
        let timeout_ms = reader.u64()?;
        reader.finish()?;
        Ok(Self {
            shard_id,
            replica_id,
            kind,
            hostname,
            timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReplicaRequest {
    pub shard_id: u64,
    pub replica_id: u64,
    pub join: bool,
    pub timeout_ms: u64,
}

impl WireMessage for StartReplicaRequest {
    const NAME: &'static str = "start_replica_request";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        PayloadWriter::versioned(Self::NAME, 25)
            .u64(self.shard_id)
            .u64(self.replica_id)
            .bool(self.join)
            .u64(self.timeout_ms)
            .finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let request = Self {
            shard_id: reader.u64()?,
            replica_id: reader.u64()?,
            join: reader.bool()?,
            timeout_ms: reader.u64()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMembersResponse {
    pub shard_id: u64,
    pub members: Membership,
}

fn put_targets(
    mut writer: PayloadWriter,
    field: &'static str,
    targets: &BTreeMap<u64, String>,
) -> PayloadWriter {
    writer = writer.count(field, targets.len());
    for (id, target) in targets {
        writer = writer.u64(*id).string(field, target);
    }
    writer
}

fn read_targets(
    reader: &mut PayloadReader<'_>,
    field: &'static str,
) -> Result<BTreeMap<u64, String>, MessageError> {
    let count = reader.u32()?;
    let mut targets = BTreeMap::new();
    for _ in 0..count {
        let id = reader.u64()?;
        targets.insert(id, reader.string(field)?);
    }
    Ok(targets)
}

impl WireMessage for ShardMembersResponse {
    const NAME: &'static str = "shard_members_response";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let members = &self.members;
        let mut writer = PayloadWriter::versioned(Self::NAME, 64)
            .u64(self.shard_id)
            .u64(members.config_change_id);
        writer = put_targets(writer, "replica_target", &members.replicas);
        writer = put_targets(writer, "observer_target", &members.observers);
        writer = put_targets(writer, "witness_target", &members.witnesses);
        writer = writer.count("removed", members.removed.len());
        for id in &members.removed {
            writer = writer.u64(*id);
        }
        writer.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let shard_id = reader.u64()?;
        let config_change_id = reader.u64()?;
        let replicas = read_targets(&mut reader, "replica_target")?;
        let observers = read_targets(&mut reader, "observer_target")?;
        let witnesses = read_targets(&mut reader, "witness_target")?;
        let removed_count = reader.u32()?;
        let mut removed = BTreeSet::new();
        for _ in 0..removed_count {
            removed.insert(reader.u64()?);
        }
        reader.finish()?;
        Ok(Self {
            shard_id,
            members: Membership {
                config_change_id,
                replicas,
                observers,
                witnesses,
                removed,
            },
        })
    }
}
