//! Subscriber facade.
//!
//! A pipe registers a topic filter with the coordinator and receives every
//! broadcast message matching it, whichever pump published it.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::Config;
use crate::protocol::{Command, PipeId, Reply, TopicFilter};
use crate::rpc::RpcEndpoint;

/// User-supplied message sink.
///
/// Invoked only for messages that already passed the registered topic
/// filter at the coordinator.
pub trait PipeHandler: Send + 'static {
    fn on_message(&mut self, topic: &str, data: &Value);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipeStatus {
    Idle,
    Working,
    Closed,
}

/// A subscriber handle.
///
/// Once stopped it is fully disposed; create a new `Pipe` to resubscribe.
pub struct Pipe {
    id: PipeId,
    topic: Option<TopicFilter>,
    rpc: Arc<RpcEndpoint>,
    handler: Option<Box<dyn PipeHandler>>,
    status: PipeStatus,
}

impl Pipe {
    pub fn new(
        channel: impl Channel + 'static,
        topic: Option<TopicFilter>,
        handler: Box<dyn PipeHandler>,
        config: &Config,
    ) -> Self {
        Self {
            id: PipeId::generate(),
            topic,
            rpc: Arc::new(RpcEndpoint::new(Box::new(channel), &config.rpc)),
            handler: Some(handler),
            status: PipeStatus::Idle,
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Register with the coordinator and start receiving matching messages.
    ///
    /// Returns `false` on any failure path (duplicate id, invalid pattern,
    /// coordinator unreachable); never panics for those.
    pub fn start(&mut self) -> bool {
        if self.status != PipeStatus::Idle {
            return false;
        }
        let Some(mut handler) = self.handler.take() else {
            return false;
        };

        self.rpc.set_handler(move |command, _responder| {
            if let Command::PipeReceive { topic, data } = command {
                handler.on_message(&topic, &data);
            }
        });

        let registered = self.rpc.call(Command::PipeRegister {
            id: self.id,
            topic: self.topic.clone(),
        });
        match registered {
            Ok(Reply::Registered(true)) => {
                self.status = PipeStatus::Working;
                debug!(pipe = %self.id, "pipe subscribed");
                true
            }
            Ok(_) => {
                warn!(pipe = %self.id, "subscription rejected");
                false
            }
            Err(err) => {
                warn!(pipe = %self.id, error = %err, "subscription failed");
                false
            }
        }
    }

    /// Close the pipe. Terminal and idempotent; also run on drop.
    pub fn stop(&mut self) {
        if self.status == PipeStatus::Closed {
            return;
        }
        self.rpc.notify(Command::PipeClose { id: self.id });
        self.rpc.close();
        self.status = PipeStatus::Closed;
        debug!(pipe = %self.id, "pipe closed");
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.stop();
    }
}
