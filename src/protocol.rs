//! Wire protocol types and codec.
//!
//! Every message on a channel is an `Envelope`: a correlation number plus
//! either a call (a `Command`) or a reply to an earlier call.
//!
//! Call format: `{"ack": 3, "type": "call", "payload": {"name": "ping"}}`
//! Reply format: `{"ack": 3, "type": "reply", "payload": {"pong": true}}`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::raft::{ElectReply, HeartbeatReply, Term};

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of one publisher registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PumpId(Uuid);

impl PumpId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one subscriber registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipeId(Uuid);

impl PipeId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identity of one election participant.
///
/// Used as the candidate id when contending and as the leader id when
/// publishing, so the coordinator can validate publish provenance without
/// trusting the channel itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(Uuid);

impl ActorId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Shared wire types
// =============================================================================

/// Connection management strategy for a pump.
///
/// `Unique` keeps a single upstream connection alive across all clients
/// sharing a category; `Standalone` is the legacy per-client mode, recorded
/// but exempt from election semantics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpMode {
    #[default]
    Unique,
    Standalone,
}

/// Subscription filter carried in a pipe registration.
///
/// `Exact` matches the topic string verbatim; `Pattern` carries a serialized
/// regular expression compiled by the coordinator at registration time.
/// Registrations without a filter match every topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicFilter {
    Exact(String),
    Pattern(String),
}

/// A published message: routing topic plus opaque payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,
    pub data: Value,
}

// =============================================================================
// Commands
// =============================================================================

/// Coordinator command set.
///
/// Whether a command awaits a reply is a call-site contract
/// ([`RpcEndpoint::call`] vs [`RpcEndpoint::notify`]), not a wire flag.
///
/// [`RpcEndpoint::call`]: crate::rpc::RpcEndpoint::call
/// [`RpcEndpoint::notify`]: crate::rpc::RpcEndpoint::notify
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Command {
    /// Health check.
    Ping,

    /// Announce a publisher. Replies `false` on a duplicate id.
    PumpRegister {
        id: PumpId,
        mode: PumpMode,
        category: String,
    },

    /// Withdraw a publisher. Fire-and-forget.
    PumpClose { id: PumpId, category: String },

    /// Contend for the category lease.
    PumpRaftElect {
        category: String,
        term: Term,
        candidate_id: ActorId,
    },

    /// Renew the category lease.
    PumpRaftHeartbeat { category: String, term: Term },

    /// Publish on behalf of the category leader. Fire-and-forget; dropped
    /// when the carried leader id has been superseded.
    PumpRaftMessaging {
        category: String,
        leader_id: ActorId,
        message: BroadcastMessage,
    },

    /// Announce a subscriber. Replies `false` on a duplicate id or an
    /// invalid topic pattern.
    PipeRegister {
        id: PipeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<TopicFilter>,
    },

    /// Withdraw a subscriber. Fire-and-forget.
    PipeClose { id: PipeId },

    /// Coordinator-to-subscriber push. Fire-and-forget.
    PipeReceive { topic: String, data: Value },
}

// =============================================================================
// Replies
// =============================================================================

/// Reply payloads, correlated to calls by the envelope ack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Registered(bool),
    Elect(ElectReply),
    Heartbeat(HeartbeatReply),
    Pong { pong: bool },
}

// =============================================================================
// Envelope
// =============================================================================

/// Unit of channel traffic.
///
/// `ack` is assigned by the call initiator, echoed verbatim in the matching
/// reply, scoped to one endpoint and never reused while outstanding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ack: u64,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Call(Command),
    Reply(Reply),
}

// =============================================================================
// Codec
// =============================================================================

/// Protocol-level errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Encode an envelope for a byte-oriented channel implementation.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode an envelope received from a byte-oriented channel implementation.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}
