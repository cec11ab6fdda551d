//! Node-local plumbing for a sharded, Raft-replicated key-value fabric.
//!
//! The crate carries three layers:
//!
//! * [`wire`]: the 16-byte-header frame protocol used by the control plane and
//!   the checksummed raw message stream used for transport payloads.
//! * [`control`]: typed Raft control/cluster requests, the dispatcher that
//!   serves them against a [`control::NodeHost`], and the matching client.
//! * [`fsm`]: the on-disk key-value state machine with nested buckets and
//!   point-in-time snapshots.
//!
//! The consensus engine itself is supplied by the embedder through
//! [`control::NodeHost`].

pub mod config;
pub mod control;
pub mod fsm;
#[cfg(feature = "net")]
pub mod net;
pub mod shard;
pub mod timeouts;
pub mod wire;

pub use config::{ConfigError, ControlConfig, NodeConfig};
pub use control::{ControlClient, ControlDispatcher, NodeHost, RuntimeError};
pub use fsm::{KeyPath, KvCommand, KvStateMachine, OnDiskStateMachine};
#[cfg(feature = "net")]
pub use net::{ControlServer, NetError};
pub use shard::{Membership, ShardState, ShardStateStore, StateMachineKind};
pub use wire::{Frame, FrameError, Service, StreamState};
