//! Subscriber registry and topic fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Limits;
use crate::hub::ConnId;
use crate::protocol::{BroadcastMessage, Command, PipeId, TopicFilter};
use crate::rpc::RpcEndpoint;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TopicError {
    #[error("invalid topic pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Topic predicate compiled once at registration time.
#[derive(Clone, Debug)]
enum CompiledFilter {
    Any,
    Exact(String),
    Pattern(Regex),
}

impl CompiledFilter {
    fn compile(filter: Option<&TopicFilter>) -> Result<Self, TopicError> {
        match filter {
            None => Ok(CompiledFilter::Any),
            Some(TopicFilter::Exact(topic)) => Ok(CompiledFilter::Exact(topic.clone())),
            Some(TopicFilter::Pattern(source)) => Ok(CompiledFilter::Pattern(Regex::new(source)?)),
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            CompiledFilter::Any => true,
            CompiledFilter::Exact(exact) => exact == topic,
            CompiledFilter::Pattern(pattern) => pattern.is_match(topic),
        }
    }
}

struct PipeRegistration {
    conn: ConnId,
    filter: CompiledFilter,
    rpc: Arc<RpcEndpoint>,
}

/// Live subscriptions of one coordinator instance.
///
/// Fan-out is at-most-once and best-effort: deliveries are fire-and-forget
/// pushes, a slow subscriber never blocks the others, and a failed delivery
/// is not retried.
pub struct Broker {
    limits: Limits,
    pipes: BTreeMap<PipeId, PipeRegistration>,
}

impl Broker {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            pipes: BTreeMap::new(),
        }
    }

    /// Add a subscription. Fails (returns `false`, keeping the existing
    /// entry) on a duplicate id, an invalid pattern, or a full registry.
    pub fn register(
        &mut self,
        id: PipeId,
        conn: ConnId,
        filter: Option<&TopicFilter>,
        rpc: Arc<RpcEndpoint>,
    ) -> bool {
        if self.pipes.contains_key(&id) {
            warn!(pipe = %id, "duplicate pipe registration");
            return false;
        }
        if self.pipes.len() >= self.limits.max_pipes {
            warn!(pipe = %id, max_pipes = self.limits.max_pipes, "pipe registry full");
            return false;
        }
        let filter = match CompiledFilter::compile(filter) {
            Ok(filter) => filter,
            Err(err) => {
                warn!(pipe = %id, error = %err, "rejecting pipe registration");
                return false;
            }
        };

        self.pipes.insert(id, PipeRegistration { conn, filter, rpc });
        debug!(pipe = %id, %conn, "pipe registered");
        true
    }

    /// Drop a subscription and its RPC handle. No-op when absent.
    pub fn unregister(&mut self, id: PipeId) {
        if self.pipes.remove(&id).is_some() {
            debug!(pipe = %id, "pipe unregistered");
        }
    }

    /// Drop every subscription owned by a hung-up connection.
    pub fn drop_connection(&mut self, conn: ConnId) {
        self.pipes.retain(|_, registration| registration.conn != conn);
    }

    /// Push the message to every subscription whose predicate matches.
    pub fn broadcast(&self, message: &BroadcastMessage) {
        for registration in self.pipes.values() {
            if !registration.filter.matches(&message.topic) {
                continue;
            }
            registration.rpc.notify(Command::PipeReceive {
                topic: message.topic.clone(),
                data: message.data.clone(),
            });
        }
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }
}
