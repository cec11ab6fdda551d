#[path = "support/runtime.rs"]
mod runtime;

use runtime::{Script, StubHost};
use shardfabric::control::{
    CompactionRequest, ControlDispatcher, DbError, DeleteReplicaRequest, Empty, ErrorDomain,
    IdResponse, IndexState, LeaderResponse, ModifyReplicaRequest, NewShardRequest,
    RaftClusterMethod, RaftControlMethod, ReadIndexRequest, ReplicaRequest, ResultCode,
    RuntimeError, ServeSummary, ShardMembersResponse, ShardRequest, StartReplicaRequest,
};
use shardfabric::wire::{
    read_response, Frame, FrameError, Service, StreamState, WireMessage,
    DEFAULT_MAX_PAYLOAD_BYTES, ERROR_METHOD,
};
use shardfabric::{ControlConfig, Membership, ShardStateStore, StateMachineKind};
use std::error::Error;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn request<M: WireMessage>(service: Service, method: u8, message: &M) -> Vec<u8> {
    Frame::new()
        .with_state(StreamState::Valid)
        .with_service(service)
        .with_method(method)
        .with_payload(message.encode().unwrap())
        .encode()
        .unwrap()
}

fn control<M: WireMessage>(method: RaftControlMethod, message: &M) -> Vec<u8> {
    request(Service::RaftControl, method.as_byte(), message)
}

fn cluster<M: WireMessage>(method: RaftClusterMethod, message: &M) -> Vec<u8> {
    request(Service::RaftCluster, method.as_byte(), message)
}

fn serve(
    dispatcher: &ControlDispatcher,
    input: Vec<u8>,
) -> Result<(ServeSummary, Vec<Frame>), Box<dyn Error>> {
    let mut reader = Cursor::new(input);
    let mut output = Vec::new();
    let summary = dispatcher.serve(&mut reader, &mut output)?;
    let mut frames = Vec::new();
    let mut responses = Cursor::new(output);
    loop {
        match read_response(&mut responses, DEFAULT_MAX_PAYLOAD_BYTES) {
            Ok(frame) => frames.push(frame),
            Err(FrameError::Closed) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok((summary, frames))
}

fn dispatcher(host: &Arc<StubHost>) -> ControlDispatcher {
    ControlDispatcher::new(host.clone(), ControlConfig::default())
}

fn assert_error_frame(frame: &Frame, service: Service, domain: ErrorDomain, needle: &str) {
    assert_eq!(frame.state(), StreamState::Valid);
    assert_eq!(frame.service(), service);
    assert_eq!(frame.method(), ERROR_METHOD);
    let error = DbError::decode(frame.payload()).expect("error payload");
    assert_eq!(error.domain, domain);
    assert!(
        error.message.contains(needle),
        "{:?} does not mention {needle:?}",
        error.message
    );
}

#[test]
fn committed_add_replica_streams_one_value_then_end() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Complete(vec![IndexState::new(ResultCode::Committed)]));
    let dispatcher = dispatcher(&host);
    let add = ModifyReplicaRequest {
        shard_id: 7,
        replica_id: 2,
        target: "node-b".into(),
        config_change_index: 0,
        timeout_ms: 5000,
    };

    let (summary, frames) = serve(&dispatcher, control(RaftControlMethod::AddReplica, &add))?;

    assert_eq!(summary, ServeSummary { handled: 1, discarded: 0 });
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].state(), StreamState::StreamStart);
    assert_eq!(frames[0].service(), Service::RaftControl);
    assert_eq!(frames[0].method(), RaftControlMethod::AddReplica.as_byte());
    let value = IndexState::decode(frames[0].payload())?;
    assert_eq!(value.status, ResultCode::Committed);
    assert_eq!(frames[1].state(), StreamState::StreamEnd);
    assert!(frames[1].payload().is_empty());
    assert_eq!(host.calls(), vec!["add Standard 7 2 node-b 0 5000".to_string()]);
    Ok(())
}

#[test]
fn observer_and_witness_methods_select_the_replica_kind() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Complete(vec![IndexState::new(ResultCode::Completed)]));
    let dispatcher = dispatcher(&host);
    let add = ModifyReplicaRequest {
        shard_id: 1,
        replica_id: 4,
        target: "node-d".into(),
        config_change_index: 12,
        timeout_ms: 0,
    };
    let mut input = control(RaftControlMethod::AddObserver, &add);
    input.extend(control(RaftControlMethod::AddWitness, &add));

    let (summary, frames) = serve(&dispatcher, input)?;

    assert_eq!(summary.handled, 2);
    assert_eq!(frames.len(), 4);
    assert_eq!(
        host.calls(),
        vec![
            "add Observer 1 4 node-d 12 3000".to_string(),
            "add Witness 1 4 node-d 12 3000".to_string(),
        ]
    );
    Ok(())
}

#[test]
fn interim_values_continue_the_stream() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Complete(vec![
        IndexState::new(ResultCode::Completed).with_snapshot_index(10),
        IndexState::new(ResultCode::Completed).with_snapshot_index(11),
        IndexState::new(ResultCode::Completed).with_snapshot_index(12),
    ]));
    let dispatcher = dispatcher(&host);

    let (_, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::ReadIndex,
            &ReadIndexRequest {
                shard_id: 3,
                timeout_ms: 250,
            },
        ),
    )?;

    let states: Vec<StreamState> = frames.iter().map(Frame::state).collect();
    assert_eq!(
        states,
        vec![
            StreamState::StreamStart,
            StreamState::StreamContinue,
            StreamState::StreamContinue,
            StreamState::StreamEnd,
        ]
    );
    let indexes = frames[..3]
        .iter()
        .map(|frame| IndexState::decode(frame.payload()).map(|state| state.snapshot_index))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(indexes, vec![10, 11, 12]);
    Ok(())
}

#[test]
fn silent_runtime_times_out_with_a_timeout_value() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Hang);
    let dispatcher = dispatcher(&host);

    let (_, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::ReadIndex,
            &ReadIndexRequest {
                shard_id: 3,
                timeout_ms: 50,
            },
        ),
    )?;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].state(), StreamState::StreamStart);
    assert_eq!(
        IndexState::decode(frames[0].payload())?.status,
        ResultCode::Timeout
    );
    assert_eq!(frames[1].state(), StreamState::StreamEnd);
    Ok(())
}

fn assert_timed_out(frames: &[Frame]) -> Result<(), Box<dyn Error>> {
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].state(), StreamState::StreamStart);
    assert_eq!(
        IndexState::decode(frames[0].payload())?.status,
        ResultCode::Timeout
    );
    assert_eq!(frames[1].state(), StreamState::StreamEnd);
    Ok(())
}

#[test]
fn compaction_wait_is_bounded_by_its_timeout() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Hang);
    let dispatcher = dispatcher(&host);

    let started = Instant::now();
    let (summary, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::RequestCompaction,
            &CompactionRequest {
                shard_id: 2,
                replica_id: 1,
                timeout_ms: 50,
            },
        ),
    )?;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(summary.handled, 1);
    assert_timed_out(&frames)?;
    assert_eq!(host.calls(), vec!["compaction 2 1".to_string()]);
    Ok(())
}

#[test]
fn compaction_without_timeout_uses_configured_default() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Hang);
    let config = ControlConfig {
        compaction_timeout_ms: 80,
        ..ControlConfig::default()
    };
    let dispatcher = ControlDispatcher::new(host.clone(), config);

    let started = Instant::now();
    let (_, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::RequestCompaction,
            &CompactionRequest {
                shard_id: 2,
                replica_id: 1,
                timeout_ms: 0,
            },
        ),
    )?;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80));
    assert!(elapsed < ControlConfig::default().default_timeout());
    assert_timed_out(&frames)
}

#[test]
fn rejected_submission_answers_with_an_error_frame() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Reject(RuntimeError::ShardNotFound(9)));
    let dispatcher = dispatcher(&host);

    let (summary, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::RequestDeleteReplica,
            &DeleteReplicaRequest {
                shard_id: 9,
                replica_id: 1,
                config_change_index: 0,
                timeout_ms: 100,
            },
        ),
    )?;

    assert_eq!(summary.handled, 1);
    assert_eq!(frames.len(), 1);
    assert_error_frame(
        &frames[0],
        Service::RaftControl,
        ErrorDomain::RaftControl,
        "shard 9 not found",
    );
    Ok(())
}

#[test]
fn runtime_failure_mid_stream_sends_stream_error_then_end() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Fail(
        vec![IndexState::new(ResultCode::Completed)],
        RuntimeError::Internal("disk full".into()),
    ));
    let dispatcher = dispatcher(&host);

    let (_, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::RequestCompaction,
            &CompactionRequest {
                shard_id: 2,
                replica_id: 1,
                timeout_ms: 0,
            },
        ),
    )?;

    let states: Vec<StreamState> = frames.iter().map(Frame::state).collect();
    assert_eq!(
        states,
        vec![
            StreamState::StreamStart,
            StreamState::StreamError,
            StreamState::StreamEnd,
        ]
    );
    let error = DbError::decode(frames[1].payload())?;
    assert_eq!(error.domain, ErrorDomain::RaftControl);
    assert!(error.message.contains("disk full"));
    Ok(())
}

#[test]
fn runtime_dropping_the_request_sends_bare_end() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.script(Script::Complete(Vec::new()));
    let dispatcher = dispatcher(&host);

    let (_, frames) = serve(
        &dispatcher,
        control(
            RaftControlMethod::ReadIndex,
            &ReadIndexRequest {
                shard_id: 3,
                timeout_ms: 1000,
            },
        ),
    )?;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].state(), StreamState::StreamEnd);
    assert!(frames[0].payload().is_empty());
    Ok(())
}

#[test]
fn malformed_frames_are_skipped_and_the_stream_stays_aligned() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host);

    let mut bad_state = control(RaftControlMethod::GetId, &Empty);
    bad_state[0] = 0x99;
    let mut bad_version = control(RaftControlMethod::GetId, &Empty);
    bad_version[1] = 7;
    let mut bad_service = control(RaftControlMethod::GetId, &Empty);
    bad_service[4] = 0x42;
    let mut input = bad_state;
    input.extend(bad_version);
    input.extend(bad_service);
    input.extend(control(RaftControlMethod::GetId, &Empty));

    let (summary, frames) = serve(&dispatcher, input)?;

    assert_eq!(summary, ServeSummary { handled: 1, discarded: 3 });
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].state(), StreamState::Valid);
    assert_eq!(IdResponse::decode(frames[0].payload())?.id, "node-a");
    Ok(())
}

#[test]
fn non_request_states_are_discarded_without_reply() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host);
    let stray = Frame::new()
        .with_state(StreamState::StreamContinue)
        .with_service(Service::RaftControl)
        .with_method(RaftControlMethod::GetId.as_byte())
        .with_payload(Empty.encode().unwrap())
        .encode()
        .unwrap();

    let (summary, frames) = serve(&dispatcher, stray)?;

    assert_eq!(summary, ServeSummary { handled: 0, discarded: 1 });
    assert!(frames.is_empty());
    assert!(host.calls().is_empty());
    Ok(())
}

#[test]
fn unknown_methods_and_services_get_error_frames() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host);
    let mut input = request(Service::RaftControl, 0x7E, &Empty);
    input.extend(request(Service::RaftCluster, 0x7E, &Empty));
    input.extend(request(Service::Session, 0x01, &Empty));

    let (summary, frames) = serve(&dispatcher, input)?;

    assert_eq!(summary.handled, 3);
    assert_eq!(frames.len(), 3);
    assert_error_frame(
        &frames[0],
        Service::RaftControl,
        ErrorDomain::RaftControl,
        "unknown raft control method",
    );
    assert_error_frame(
        &frames[1],
        Service::RaftCluster,
        ErrorDomain::RaftCluster,
        "unknown raft cluster method",
    );
    assert_error_frame(&frames[2], Service::Session, ErrorDomain::Session, "session");
    Ok(())
}

#[test]
fn undecodable_payload_gets_an_error_frame() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host);
    let frame = Frame::new()
        .with_state(StreamState::Valid)
        .with_service(Service::RaftControl)
        .with_method(RaftControlMethod::ReadIndex.as_byte())
        .with_payload(vec![1, 2])
        .encode()
        .unwrap();

    let (_, frames) = serve(&dispatcher, frame)?;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].method(), ERROR_METHOD);
    assert!(host.calls().is_empty());
    Ok(())
}

#[test]
fn truncated_frame_ends_the_stream_with_an_error() {
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host);
    let mut frame = control(RaftControlMethod::GetId, &Empty);
    frame.truncate(10);
    let mut output = Vec::new();

    let result = dispatcher.serve(&mut Cursor::new(frame), &mut output);

    assert!(result.is_err());
    assert!(output.is_empty());
}

#[test]
fn unary_control_methods_answer_with_valid_frames() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    host.set_leader(Some(3));
    let dispatcher = dispatcher(&host);
    let mut input = control(RaftControlMethod::GetLeaderId, &ShardRequest { shard_id: 5 });
    input.extend(control(
        RaftControlMethod::StopReplica,
        &ReplicaRequest {
            shard_id: 5,
            replica_id: 2,
        },
    ));
    input.extend(control(RaftControlMethod::Stop, &Empty));

    let (_, frames) = serve(&dispatcher, input)?;

    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|frame| frame.state() == StreamState::Valid));
    let leader = LeaderResponse::decode(frames[0].payload())?;
    assert_eq!(leader.leader_id, 3);
    assert!(leader.available);
    Empty::decode(frames[1].payload())?;
    Empty::decode(frames[2].payload())?;
    assert_eq!(
        host.calls(),
        vec![
            "leader 5".to_string(),
            "stop_replica 5 2".to_string(),
            "stop".to_string(),
        ]
    );
    Ok(())
}

#[test]
fn unknown_leader_reports_unavailable() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host);

    let (_, frames) = serve(
        &dispatcher,
        control(RaftControlMethod::GetLeaderId, &ShardRequest { shard_id: 5 }),
    )?;

    let leader = LeaderResponse::decode(frames[0].payload())?;
    assert!(!leader.available);
    Ok(())
}

#[test]
fn new_shard_persists_state_and_rejects_duplicates() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path().join("shards"));
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host).with_shard_store(store.clone());
    let create = NewShardRequest {
        shard_id: 11,
        replica_id: 1,
        kind: StateMachineKind::Kv,
        hostname: "node-a:9000".into(),
        timeout_ms: 0,
    };
    let mut input = cluster(RaftClusterMethod::NewShard, &create);
    input.extend(cluster(RaftClusterMethod::NewShard, &create));

    let (_, frames) = serve(&dispatcher, input)?;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].state(), StreamState::Valid);
    assert_eq!(frames[0].method(), RaftClusterMethod::NewShard.as_byte());
    assert_error_frame(
        &frames[1],
        Service::RaftCluster,
        ErrorDomain::RaftCluster,
        "already exists",
    );
    let state = store.load(11)?.expect("persisted shard state");
    assert_eq!(state.replica_id, 1);
    assert_eq!(state.kind, StateMachineKind::Kv);
    assert!(state.members.contains(1));
    assert_eq!(host.started(), vec![(11, 1, false)]);
    Ok(())
}

#[test]
fn start_replica_requires_a_known_shard() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path().join("shards"));
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host).with_shard_store(store.clone());
    let mut input = cluster(
        RaftClusterMethod::NewShard,
        &NewShardRequest {
            shard_id: 4,
            replica_id: 2,
            kind: StateMachineKind::Test,
            hostname: "node-a:9000".into(),
            timeout_ms: 0,
        },
    );
    input.extend(cluster(
        RaftClusterMethod::StartReplica,
        &StartReplicaRequest {
            shard_id: 4,
            replica_id: 2,
            join: true,
            timeout_ms: 0,
        },
    ));
    input.extend(cluster(
        RaftClusterMethod::StartReplica,
        &StartReplicaRequest {
            shard_id: 99,
            replica_id: 1,
            join: false,
            timeout_ms: 0,
        },
    ));

    let (_, frames) = serve(&dispatcher, input)?;

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[1].method(), RaftClusterMethod::StartReplica.as_byte());
    assert_error_frame(
        &frames[2],
        Service::RaftCluster,
        ErrorDomain::RaftCluster,
        "shard 99 not found",
    );
    assert!(store.load(4)?.expect("shard 4").join);
    assert_eq!(host.started(), vec![(4, 2, false), (4, 2, true)]);
    Ok(())
}

#[test]
fn remove_data_drops_persisted_state() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path().join("shards"));
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host).with_shard_store(store.clone());
    let mut input = cluster(
        RaftClusterMethod::NewShard,
        &NewShardRequest {
            shard_id: 6,
            replica_id: 1,
            kind: StateMachineKind::Kv,
            hostname: "node-a:9000".into(),
            timeout_ms: 0,
        },
    );
    input.extend(cluster(
        RaftClusterMethod::RemoveData,
        &ReplicaRequest {
            shard_id: 6,
            replica_id: 1,
        },
    ));

    let (_, frames) = serve(&dispatcher, input)?;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].method(), RaftClusterMethod::RemoveData.as_byte());
    assert!(store.load(6)?.is_none());
    assert!(host.calls().contains(&"remove_data 6 1".to_string()));
    Ok(())
}

#[test]
fn committed_membership_change_refreshes_persisted_members() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path().join("shards"));
    let host = Arc::new(StubHost::new("node-a"));
    let dispatcher = dispatcher(&host).with_shard_store(store.clone());
    let mut input = cluster(
        RaftClusterMethod::NewShard,
        &NewShardRequest {
            shard_id: 8,
            replica_id: 1,
            kind: StateMachineKind::Kv,
            hostname: "node-a:9000".into(),
            timeout_ms: 0,
        },
    );
    input.extend(control(
        RaftControlMethod::AddReplica,
        &ModifyReplicaRequest {
            shard_id: 8,
            replica_id: 2,
            target: "node-b:9000".into(),
            config_change_index: 0,
            timeout_ms: 1000,
        },
    ));
    let mut members = Membership::single(1, "node-a:9000");
    members.replicas.insert(2, "node-b:9000".into());
    members.config_change_id = 5;
    host.set_members(members.clone());
    host.script(Script::Complete(vec![IndexState::new(ResultCode::Committed)]));

    serve(&dispatcher, input)?;

    assert_eq!(store.load(8)?.expect("shard 8").members, members);
    Ok(())
}

#[test]
fn shard_members_returns_runtime_membership() -> Result<(), Box<dyn Error>> {
    let host = Arc::new(StubHost::new("node-a"));
    let mut members = Membership::single(1, "node-a:9000");
    members.observers.insert(3, "node-c:9000".into());
    host.set_members(members.clone());
    let dispatcher = dispatcher(&host);

    let (_, frames) = serve(
        &dispatcher,
        cluster(RaftClusterMethod::GetShardMembers, &ShardRequest { shard_id: 2 }),
    )?;

    let response = ShardMembersResponse::decode(frames[0].payload())?;
    assert_eq!(response.shard_id, 2);
    assert_eq!(response.members, members);
    Ok(())
}
