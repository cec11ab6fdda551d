use crate::config::ControlConfig;
use crate::control::messages::{
    timeout_from_ms, CompactionRequest, DbError, DeleteReplicaRequest, Empty, ErrorDomain,
    IdResponse, IndexState, LeaderResponse, LeaderTransferRequest, ModifyReplicaRequest,
    NewShardRequest, RaftClusterMethod, RaftControlMethod, ReadIndexRequest, ReplicaRequest,
    ResultCode, ShardMembersResponse, ShardRequest, SnapshotRequest, StartReplicaRequest,
};
use crate::control::runtime::{HandleEvent, NodeHost, ReplicaKind, RequestHandle, RuntimeError};
use crate::shard::{ShardState, ShardStateStore};
use crate::wire::{
    write_error, write_unary, Frame, FrameError, MessageError, ResponseWriter, Service,
    StreamState, WireMessage,
};
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to read request frame: {0}")]
    Read(#[source] FrameError),
    #[error("failed to write response: {0}")]
    Write(#[from] io::Error),
    #[error("failed to encode error response: {0}")]
    Encode(#[from] MessageError),
}

/// Counters reported when a stream closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub handled: u64,
    pub discarded: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StreamOutcome {
    sent: usize,
    committed: bool,
    timed_out: bool,
}

/// Serves control requests from one stream against a [`NodeHost`].
///
/// Holds no per-request state; several connection threads may share one
/// dispatcher.
pub struct ControlDispatcher {
    host: Arc<dyn NodeHost>,
    config: ControlConfig,
    shards: Option<ShardStateStore>,
}

impl ControlDispatcher {
    pub fn new(host: Arc<dyn NodeHost>, config: ControlConfig) -> Self {
        Self {
            host,
            config,
            shards: None,
        }
    }

    /// Persist shard configuration changes made through the cluster service.
    pub fn with_shard_store(mut self, store: ShardStateStore) -> Self {
        self.shards = Some(store);
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Runs the read loop until the peer closes the stream.
    ///
    /// Malformed frames are logged and skipped. Truncated frames and I/O
    /// failures end the loop with an error; a `ConnectionAborted` read is
    /// treated as a local shutdown request.
    pub fn serve<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<ServeSummary, DispatchError> {
        let mut summary = ServeSummary::default();
        loop {
            match Frame::read_from(reader, self.config.max_payload_bytes) {
                Ok(frame) => {
                    if self.handle_frame(frame, writer)? {
                        summary.handled += 1;
                    } else {
                        summary.discarded += 1;
                    }
                }
                Err(FrameError::Closed) => break,
                Err(FrameError::Io(err)) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!("event=control_stream_aborted");
                    break;
                }
                Err(err) if err.is_frame_local() => {
                    warn!("event=control_frame_discarded error={err}");
                    summary.discarded += 1;
                }
                Err(err) => return Err(DispatchError::Read(err)),
            }
        }
        info!(
            "event=control_stream_closed handled={} discarded={}",
            summary.handled, summary.discarded
        );
        Ok(summary)
    }

    /// Answers one decoded request. Returns `false` when the frame was not a
    /// request and was dropped.
    pub fn handle_frame<W: Write>(&self, frame: Frame, writer: &mut W) -> Result<bool, DispatchError> {
        if frame.state() != StreamState::Valid {
            warn!(
                "event=control_frame_discarded reason=unexpected_state state={:?} service={} method={:#04x}",
                frame.state(),
                frame.service(),
                frame.method()
            );
            return Ok(false);
        }
        let service = frame.service();
        match service {
            Service::RaftControl => match RaftControlMethod::from_byte(frame.method()) {
                Some(method) => self.raft_control(method, frame.payload(), writer)?,
                None => self.reject(
                    writer,
                    service,
                    format!("unknown raft control method {:#04x}", frame.method()),
                )?,
            },
            Service::RaftCluster => match RaftClusterMethod::from_byte(frame.method()) {
                Some(method) => self.raft_cluster(method, frame.payload(), writer)?,
                None => self.reject(
                    writer,
                    service,
                    format!("unknown raft cluster method {:#04x}", frame.method()),
                )?,
            },
            Service::Session | Service::BasicAuth | Service::Unspecified => self.reject(
                writer,
                service,
                format!("service {service} is not served by this node"),
            )?,
        }
        Ok(true)
    }

    fn raft_control<W: Write>(
        &self,
        method: RaftControlMethod,
        payload: &[u8],
        writer: &mut W,
    ) -> Result<(), DispatchError> {
        use RaftControlMethod::*;
        let service = Service::RaftControl;
        let code = method.as_byte();
        let default = self.config.default_timeout();
        match method {
            AddReplica | AddObserver | AddWitness => {
                let Some(request) = self.decode::<ModifyReplicaRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let kind = match method {
                    AddObserver => ReplicaKind::Observer,
                    AddWitness => ReplicaKind::Witness,
                    _ => ReplicaKind::Standard,
                };
                let timeout = timeout_from_ms(request.timeout_ms, default);
                debug!(
                    "event=control_add_replica kind={kind:?} shard_id={} replica_id={} target={} ccid={}",
                    request.shard_id, request.replica_id, request.target, request.config_change_index
                );
                let submitted = self.host.request_add_replica(
                    kind,
                    request.shard_id,
                    request.replica_id,
                    &request.target,
                    request.config_change_index,
                    timeout,
                );
                let outcome = self.stream(writer, service, code, submitted, timeout)?;
                if outcome.committed {
                    self.refresh_members(request.shard_id);
                }
            }
            RequestDeleteReplica => {
                let Some(request) = self.decode::<DeleteReplicaRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let timeout = timeout_from_ms(request.timeout_ms, default);
                let submitted = self.host.request_delete_replica(
                    request.shard_id,
                    request.replica_id,
                    request.config_change_index,
                    timeout,
                );
                let outcome = self.stream(writer, service, code, submitted, timeout)?;
                if outcome.committed {
                    self.refresh_members(request.shard_id);
                }
            }
            ReadIndex => {
                let Some(request) = self.decode::<ReadIndexRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let timeout = timeout_from_ms(request.timeout_ms, default);
                let submitted = self.host.read_index(request.shard_id, timeout);
                self.stream(writer, service, code, submitted, timeout)?;
            }
            RequestCompaction => {
                let Some(request) = self.decode::<CompactionRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let timeout =
                    timeout_from_ms(request.timeout_ms, self.config.compaction_timeout());
                let submitted = self
                    .host
                    .request_compaction(request.shard_id, request.replica_id);
                let outcome = self.stream(writer, service, code, submitted, timeout)?;
                if outcome.timed_out {
                    info!(
                        "event=control_compaction_wait_expired shard_id={} replica_id={} timeout_ms={}",
                        request.shard_id,
                        request.replica_id,
                        timeout.as_millis()
                    );
                }
            }
            RequestSnapshot => {
                let Some(request) = self.decode::<SnapshotRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let timeout = timeout_from_ms(request.timeout_ms, default);
                let submitted =
                    self.host
                        .request_snapshot(request.shard_id, &request.options, timeout);
                self.stream(writer, service, code, submitted, timeout)?;
            }
            GetId => {
                if self.decode::<Empty, _>(writer, service, payload)?.is_none() {
                    return Ok(());
                }
                let id = IdResponse { id: self.host.id() };
                self.unary(writer, service, code, Ok(id))?;
            }
            GetLeaderId => {
                let Some(request) = self.decode::<ShardRequest, _>(writer, service, payload)? else {
                    return Ok(());
                };
                let result = self
                    .host
                    .get_leader_id(request.shard_id)
                    .map(|leader| LeaderResponse {
                        leader_id: leader.unwrap_or(0),
                        available: leader.is_some(),
                    });
                self.unary(writer, service, code, result)?;
            }
            RequestLeaderTransfer => {
                let Some(request) =
                    self.decode::<LeaderTransferRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let result = self
                    .host
                    .request_leader_transfer(request.shard_id, request.target_replica_id)
                    .map(|()| Empty);
                self.unary(writer, service, code, result)?;
            }
            StopReplica => {
                let Some(request) = self.decode::<ReplicaRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let result = self
                    .host
                    .stop_replica(request.shard_id, request.replica_id)
                    .map(|()| Empty);
                self.unary(writer, service, code, result)?;
            }
            Stop => {
                if self.decode::<Empty, _>(writer, service, payload)?.is_none() {
                    return Ok(());
                }
                info!("event=control_stop_requested");
                let result = self.host.stop().map(|()| Empty);
                self.unary(writer, service, code, result)?;
            }
        }
        Ok(())
    }

    fn raft_cluster<W: Write>(
        &self,
        method: RaftClusterMethod,
        payload: &[u8],
        writer: &mut W,
    ) -> Result<(), DispatchError> {
        let service = Service::RaftCluster;
        let code = method.as_byte();
        let default = self.config.default_timeout();
        match method {
            RaftClusterMethod::NewShard => {
                let Some(request) = self.decode::<NewShardRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let result = self.new_shard(&request, timeout_from_ms(request.timeout_ms, default));
                self.unary(writer, service, code, result.map(|()| Empty))?;
            }
            RaftClusterMethod::StartReplica => {
                let Some(request) =
                    self.decode::<StartReplicaRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let result =
                    self.start_replica(&request, timeout_from_ms(request.timeout_ms, default));
                self.unary(writer, service, code, result.map(|()| Empty))?;
            }
            RaftClusterMethod::RemoveData => {
                let Some(request) = self.decode::<ReplicaRequest, _>(writer, service, payload)?
                else {
                    return Ok(());
                };
                let result = self.remove_data(&request);
                self.unary(writer, service, code, result.map(|()| Empty))?;
            }
            RaftClusterMethod::GetShardMembers => {
                let Some(request) = self.decode::<ShardRequest, _>(writer, service, payload)? else {
                    return Ok(());
                };
                let result = self
                    .host
                    .shard_membership(request.shard_id, default)
                    .map(|members| {
                        self.persist_members(request.shard_id, &members);
                        ShardMembersResponse {
                            shard_id: request.shard_id,
                            members,
                        }
                    });
                self.unary(writer, service, code, result)?;
            }
        }
        Ok(())
    }

    fn new_shard(&self, request: &NewShardRequest, timeout: Duration) -> Result<(), RuntimeError> {
        if let Some(store) = &self.shards {
            let existing = store
                .load(request.shard_id)
                .map_err(|err| RuntimeError::Internal(err.to_string()))?;
            if existing.is_some() {
                return Err(RuntimeError::ShardAlreadyExists(request.shard_id));
            }
        }
        let state = ShardState::bootstrap(
            request.shard_id,
            request.replica_id,
            request.kind,
            request.hostname.clone(),
        );
        self.host.start_replica(&state, false, timeout)?;
        if let Some(store) = &self.shards {
            store.save(&state).map_err(|err| {
                RuntimeError::Internal(format!("replica started but state not persisted: {err}"))
            })?;
        }
        info!(
            "event=shard_created shard_id={} replica_id={} kind={:?}",
            request.shard_id, request.replica_id, request.kind
        );
        Ok(())
    }

    fn start_replica(
        &self,
        request: &StartReplicaRequest,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let store = self.shards.as_ref().ok_or_else(|| {
            RuntimeError::Rejected("no shard state store configured on this node".into())
        })?;
        let mut state = store
            .load(request.shard_id)
            .map_err(|err| RuntimeError::Internal(err.to_string()))?
            .ok_or(RuntimeError::ShardNotFound(request.shard_id))?;
        if state.replica_id != request.replica_id {
            return Err(RuntimeError::ReplicaNotFound {
                shard_id: request.shard_id,
                replica_id: request.replica_id,
            });
        }
        self.host.start_replica(&state, request.join, timeout)?;
        if state.join != request.join {
            state.join = request.join;
            if let Err(err) = store.save(&state) {
                warn!(
                    "event=shard_state_persist_failed shard_id={} error={err}",
                    request.shard_id
                );
            }
        }
        info!(
            "event=replica_started shard_id={} replica_id={} join={}",
            request.shard_id, request.replica_id, request.join
        );
        Ok(())
    }

    fn remove_data(&self, request: &ReplicaRequest) -> Result<(), RuntimeError> {
        self.host
            .remove_data(request.shard_id, request.replica_id)?;
        if let Some(store) = &self.shards {
            store
                .remove(request.shard_id)
                .map_err(|err| RuntimeError::Internal(err.to_string()))?;
        }
        info!(
            "event=replica_data_removed shard_id={} replica_id={}",
            request.shard_id, request.replica_id
        );
        Ok(())
    }

    fn refresh_members(&self, shard_id: u64) {
        if self.shards.is_none() {
            return;
        }
        match self
            .host
            .shard_membership(shard_id, self.config.default_timeout())
        {
            Ok(members) => self.persist_members(shard_id, &members),
            Err(err) => warn!("event=shard_membership_refresh_failed shard_id={shard_id} error={err}"),
        }
    }

    fn persist_members(&self, shard_id: u64, members: &crate::shard::Membership) {
        let Some(store) = &self.shards else {
            return;
        };
        match store.update_members(shard_id, members.clone()) {
            Ok(true) => debug!(
                "event=shard_membership_persisted shard_id={shard_id} ccid={}",
                members.config_change_id
            ),
            Ok(false) => debug!("event=shard_membership_untracked shard_id={shard_id}"),
            Err(err) => warn!("event=shard_state_persist_failed shard_id={shard_id} error={err}"),
        }
    }

    /// Forwards every value of `submitted` as a stream and always terminates
    /// it. A submission failure becomes a single error frame instead.
    fn stream<W: Write>(
        &self,
        writer: &mut W,
        service: Service,
        method: u8,
        submitted: Result<RequestHandle, RuntimeError>,
        timeout: Duration,
    ) -> Result<StreamOutcome, DispatchError> {
        let handle = match submitted {
            Ok(handle) => handle,
            Err(err) => {
                warn!("event=control_request_rejected service={service} method={method:#04x} error={err}");
                self.reject(writer, service, err.to_string())?;
                return Ok(StreamOutcome::default());
            }
        };
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut outcome = StreamOutcome::default();
        let mut stream = ResponseWriter::new(writer, service, method);
        loop {
            match handle.next(deadline) {
                HandleEvent::Value(state) => {
                    outcome.committed |= state.status == ResultCode::Committed;
                    if !Self::send_value(&mut stream, service, method, &state)? {
                        break;
                    }
                }
                HandleEvent::Final(state) => {
                    outcome.committed |= state.status == ResultCode::Committed;
                    Self::send_value(&mut stream, service, method, &state)?;
                    break;
                }
                HandleEvent::Failed(err) => {
                    warn!("event=control_request_failed service={service} method={method:#04x} error={err}");
                    let error = DbError::new(error_domain(service), err.to_string());
                    stream.send_error(error.encode()?)?;
                    break;
                }
                HandleEvent::Finished => break,
                HandleEvent::TimedOut => {
                    outcome.timed_out = true;
                    if stream.sent() == 0 {
                        stream.send(IndexState::new(ResultCode::Timeout).encode()?)?;
                    }
                    break;
                }
            }
        }
        outcome.sent = stream.finish()?;
        debug!(
            "event=control_stream_finished service={service} method={method:#04x} frames={} timed_out={}",
            outcome.sent, outcome.timed_out
        );
        Ok(outcome)
    }

    fn unary<W: Write, M: WireMessage>(
        &self,
        writer: &mut W,
        service: Service,
        method: u8,
        result: Result<M, RuntimeError>,
    ) -> Result<(), DispatchError> {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!("event=control_request_rejected service={service} method={method:#04x} error={err}");
                return self.reject(writer, service, err.to_string());
            }
        };
        match response.encode() {
            Ok(payload) => write_unary(writer, service, method, payload)?,
            Err(err) => {
                warn!("event=control_response_unencodable service={service} method={method:#04x} error={err}");
                self.reject(writer, service, err.to_string())?;
            }
        }
        Ok(())
    }

    /// Decodes a request payload, answering with an error frame on failure.
    fn decode<M: WireMessage, W: Write>(
        &self,
        writer: &mut W,
        service: Service,
        payload: &[u8],
    ) -> Result<Option<M>, DispatchError> {
        match M::decode(payload) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                warn!("event=control_request_undecodable service={service} error={err}");
                self.reject(writer, service, err.to_string())?;
                Ok(None)
            }
        }
    }

    fn reject<W: Write>(
        &self,
        writer: &mut W,
        service: Service,
        message: String,
    ) -> Result<(), DispatchError> {
        let error = DbError::new(error_domain(service), message);
        write_error(writer, service, error.encode()?)?;
        Ok(())
    }

    /// Writes one streamed value. A value that cannot be encoded is reported
    /// as a `StreamError` and ends the stream; returns whether to continue.
    fn send_value<W: Write>(
        stream: &mut ResponseWriter<'_, W>,
        service: Service,
        method: u8,
        state: &IndexState,
    ) -> Result<bool, DispatchError> {
        match state.encode() {
            Ok(payload) => {
                stream.send(payload)?;
                Ok(true)
            }
            Err(err) => {
                warn!("event=control_response_unencodable service={service} method={method:#04x} error={err}");
                let error = DbError::new(error_domain(service), err.to_string());
                stream.send_error(error.encode()?)?;
                Ok(false)
            }
        }
    }
}

/// Error domain reported for failures on `service`.
pub fn error_domain(service: Service) -> ErrorDomain {
    match service {
        Service::RaftControl => ErrorDomain::RaftControl,
        Service::RaftCluster => ErrorDomain::RaftCluster,
        Service::Session | Service::BasicAuth | Service::Unspecified => ErrorDomain::Session,
    }
}
