#![forbid(unsafe_code)]

//! Shared-connection coordination.
//!
//! Many independent clients share a small number of long-lived upstream
//! connections through one coordinator ([`Hub`]). For every named
//! connection ("category"), exactly one [`Pump`] at a time is elected to
//! drive the upstream; whatever it publishes is fanned out to every
//! [`Pipe`] whose topic filter matches. Election, failover and
//! request/response correlation all ride a minimal duplex
//! [`Channel`](channel::Channel) contract, so the same core runs over the
//! in-process loopback transport or any host-provided one.

pub mod channel;
pub mod config;
pub mod error;
pub mod hub;
pub mod pipe;
pub mod protocol;
pub mod pump;
pub mod raft;
pub mod rpc;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use config::{Config, Limits, RaftConfig, RpcConfig};
pub use hub::{ConnId, Hub, TopicError};
pub use pipe::{Pipe, PipeHandler};
pub use protocol::{
    ActorId, BroadcastMessage, Command, Envelope, PipeId, PumpId, PumpMode, Reply, TopicFilter,
};
pub use pump::{Pump, PumpDriver, PumpOptions};
pub use raft::{Actor, Dealer, ElectReply, HeartbeatReply, Term};
pub use rpc::{RpcEndpoint, RpcError};
