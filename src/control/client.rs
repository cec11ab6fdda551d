use crate::control::messages::{
    CompactionRequest, DbError, DeleteReplicaRequest, Empty, IdResponse, IndexState,
    LeaderResponse, LeaderTransferRequest, ModifyReplicaRequest, NewShardRequest,
    RaftClusterMethod, RaftControlMethod, ReadIndexRequest, ReplicaRequest, ShardMembersResponse,
    ShardRequest, SnapshotRequest, StartReplicaRequest,
};
use crate::control::runtime::ReplicaKind;
use crate::shard::Membership;
use crate::wire::{
    read_response, Frame, FrameError, MessageError, Service, StreamState, WireMessage,
    DEFAULT_MAX_PAYLOAD_BYTES, ERROR_METHOD,
};
use log::debug;
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("payload error: {0}")]
    Message(#[from] MessageError),
    #[error("remote error: {0}")]
    Remote(DbError),
    #[error("unexpected {state:?} frame for method {method:#04x}")]
    UnexpectedFrame { state: StreamState, method: u8 },
}

/// Issues control requests over one duplex stream, one request at a time.
pub struct ControlClient<S> {
    stream: S,
    max_payload: usize,
}

impl<S: Read + Write> ControlClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_payload: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn add_replica(
        &mut self,
        kind: ReplicaKind,
        request: &ModifyReplicaRequest,
    ) -> Result<Vec<IndexState>, ClientError> {
        let method = match kind {
            ReplicaKind::Standard => RaftControlMethod::AddReplica,
            ReplicaKind::Observer => RaftControlMethod::AddObserver,
            ReplicaKind::Witness => RaftControlMethod::AddWitness,
        };
        self.streamed(method, request)
    }

    pub fn delete_replica(
        &mut self,
        request: &DeleteReplicaRequest,
    ) -> Result<Vec<IndexState>, ClientError> {
        self.streamed(RaftControlMethod::RequestDeleteReplica, request)
    }

    pub fn read_index(&mut self, request: &ReadIndexRequest) -> Result<Vec<IndexState>, ClientError> {
        self.streamed(RaftControlMethod::ReadIndex, request)
    }

    pub fn request_compaction(
        &mut self,
        request: &CompactionRequest,
    ) -> Result<Vec<IndexState>, ClientError> {
        self.streamed(RaftControlMethod::RequestCompaction, request)
    }

    pub fn request_snapshot(
        &mut self,
        request: &SnapshotRequest,
    ) -> Result<Vec<IndexState>, ClientError> {
        self.streamed(RaftControlMethod::RequestSnapshot, request)
    }

    pub fn get_id(&mut self) -> Result<String, ClientError> {
        let response: IdResponse =
            self.unary(Service::RaftControl, RaftControlMethod::GetId.as_byte(), &Empty)?;
        Ok(response.id)
    }

    /// `None` while the shard has no known leader.
    pub fn get_leader_id(&mut self, shard_id: u64) -> Result<Option<u64>, ClientError> {
        let response: LeaderResponse = self.unary(
            Service::RaftControl,
            RaftControlMethod::GetLeaderId.as_byte(),
            &ShardRequest { shard_id },
        )?;
        Ok(response.available.then_some(response.leader_id))
    }

    pub fn leader_transfer(&mut self, request: &LeaderTransferRequest) -> Result<(), ClientError> {
        let _: Empty = self.unary(
            Service::RaftControl,
            RaftControlMethod::RequestLeaderTransfer.as_byte(),
            request,
        )?;
        Ok(())
    }

    pub fn stop_replica(&mut self, request: &ReplicaRequest) -> Result<(), ClientError> {
        let _: Empty = self.unary(
            Service::RaftControl,
            RaftControlMethod::StopReplica.as_byte(),
            request,
        )?;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ClientError> {
        let _: Empty = self.unary(Service::RaftControl, RaftControlMethod::Stop.as_byte(), &Empty)?;
        Ok(())
    }

    pub fn new_shard(&mut self, request: &NewShardRequest) -> Result<(), ClientError> {
        let _: Empty = self.unary(
            Service::RaftCluster,
            RaftClusterMethod::NewShard.as_byte(),
            request,
        )?;
        Ok(())
    }

    pub fn start_replica(&mut self, request: &StartReplicaRequest) -> Result<(), ClientError> {
        let _: Empty = self.unary(
            Service::RaftCluster,
            RaftClusterMethod::StartReplica.as_byte(),
            request,
        )?;
        Ok(())
    }

    pub fn remove_data(&mut self, request: &ReplicaRequest) -> Result<(), ClientError> {
        let _: Empty = self.unary(
            Service::RaftCluster,
            RaftClusterMethod::RemoveData.as_byte(),
            request,
        )?;
        Ok(())
    }

    pub fn shard_members(&mut self, shard_id: u64) -> Result<Membership, ClientError> {
        let response: ShardMembersResponse = self.unary(
            Service::RaftCluster,
            RaftClusterMethod::GetShardMembers.as_byte(),
            &ShardRequest { shard_id },
        )?;
        Ok(response.members)
    }

    /// Sends an arbitrary frame and returns the next response frame.
    pub fn round_trip(&mut self, frame: &Frame) -> Result<Frame, ClientError> {
        self.send(frame)?;
        Ok(read_response(&mut self.stream, self.max_payload)?)
    }

    fn send(&mut self, frame: &Frame) -> Result<(), ClientError> {
        self.stream.write_all(&frame.encode()?)?;
        self.stream.flush()?;
        Ok(())
    }

    fn request<M: WireMessage>(&mut self, service: Service, method: u8, request: &M) -> Result<(), ClientError> {
        debug!(
            "event=control_request service={service} method={method:#04x} message={}",
            M::NAME
        );
        let frame = Frame::new()
            .with_state(StreamState::Valid)
            .with_service(service)
            .with_method(method)
            .with_payload(request.encode()?);
        self.send(&frame)
    }

    fn unary<Req: WireMessage, Resp: WireMessage>(
        &mut self,
        service: Service,
        method: u8,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        self.request(service, method, request)?;
        let frame = read_response(&mut self.stream, self.max_payload)?;
        match (frame.state(), frame.method()) {
            (StreamState::Valid, ERROR_METHOD) => {
                Err(ClientError::Remote(DbError::decode(frame.payload())?))
            }
            (StreamState::Valid, observed) if observed == method => {
                Ok(Resp::decode(frame.payload())?)
            }
            (state, observed) => Err(ClientError::UnexpectedFrame {
                state,
                method: observed,
            }),
        }
    }

    /// Collects a streamed response through its terminator. An error frame
    /// in place of the stream, or a `StreamError` inside it, is returned as
    /// [`ClientError::Remote`] once the stream is drained.
    fn streamed<M: WireMessage>(
        &mut self,
        method: RaftControlMethod,
        request: &M,
    ) -> Result<Vec<IndexState>, ClientError> {
        let code = method.as_byte();
        self.request(Service::RaftControl, code, request)?;
        let mut values = Vec::new();
        let mut failure = None;
        loop {
            let frame = read_response(&mut self.stream, self.max_payload)?;
            match frame.state() {
                StreamState::Valid if frame.method() == ERROR_METHOD && values.is_empty() => {
                    return Err(ClientError::Remote(DbError::decode(frame.payload())?));
                }
                StreamState::StreamStart if values.is_empty() => {
                    values.push(IndexState::decode(frame.payload())?);
                }
                StreamState::StreamContinue if !values.is_empty() => {
                    values.push(IndexState::decode(frame.payload())?);
                }
                StreamState::StreamError => {
                    failure = Some(DbError::decode(frame.payload())?);
                }
                StreamState::StreamEnd => break,
                state => {
                    return Err(ClientError::UnexpectedFrame {
                        state,
                        method: frame.method(),
                    })
                }
            }
        }
        match failure {
            Some(error) => Err(ClientError::Remote(error)),
            None => Ok(values),
        }
    }
}
