//! Publisher facade.
//!
//! A pump registers under a category, contends for that category's lease,
//! and — while it holds the lease — drives the user's upstream connection
//! and publishes on behalf of every client sharing the category.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::Config;
use crate::protocol::{BroadcastMessage, Command, PumpId, PumpMode, Reply};
use crate::raft::{
    Actor, ElectReply, ElectRequest, HeartbeatReply, HeartbeatRequest, LeaseHooks, LeaseTransport,
    MessagingRequest,
};
use crate::rpc::{RpcError, RpcEndpoint};

/// User-supplied upstream connection management.
pub trait PumpDriver: Send + 'static {
    /// Bring the upstream connection up. Returning `false` signals a failed
    /// connect: the lease falls back to contention and another pump (or this
    /// one, next round) retries.
    fn connect(&mut self) -> bool;

    /// Tear the upstream connection down. Nothing should be permanently
    /// disposed here: the same pump may be scheduled to connect again.
    fn disconnect(&mut self);
}

#[derive(Clone, Debug)]
pub struct PumpOptions {
    /// The sharing key: all pumps with the same category contend for one
    /// upstream connection.
    pub category: String,
    pub mode: PumpMode,
}

impl PumpOptions {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            mode: PumpMode::default(),
        }
    }
}

/// Per-process category claims, independent of (and in addition to) the
/// cross-client election: one live pump per category per process, however
/// the election turns out.
fn local_categories() -> &'static Mutex<HashSet<String>> {
    static LOCAL_CATEGORIES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    LOCAL_CATEGORIES.get_or_init(|| Mutex::new(HashSet::new()))
}

fn claim_category(category: &str) -> bool {
    local_categories()
        .lock()
        .map(|mut claims| claims.insert(category.to_string()))
        .unwrap_or(false)
}

fn release_category(category: &str) {
    if let Ok(mut claims) = local_categories().lock() {
        claims.remove(category);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PumpStatus {
    Idle,
    Working,
    Closed,
}

/// A publisher handle.
///
/// Once stopped it is fully disposed and cannot be started again; create a
/// new `Pump` to rejoin the category.
pub struct Pump {
    id: PumpId,
    category: String,
    mode: PumpMode,
    rpc: Arc<RpcEndpoint>,
    raft_config: crate::config::RaftConfig,
    driver: Option<Box<dyn PumpDriver>>,
    actor: Option<Actor>,
    status: PumpStatus,
    claimed: bool,
}

impl Pump {
    pub fn new(
        channel: impl Channel + 'static,
        options: PumpOptions,
        driver: Box<dyn PumpDriver>,
        config: &Config,
    ) -> Self {
        Self {
            id: PumpId::generate(),
            category: options.category,
            mode: options.mode,
            rpc: Arc::new(RpcEndpoint::new(Box::new(channel), &config.rpc)),
            raft_config: config.raft.clone(),
            driver: Some(driver),
            actor: None,
            status: PumpStatus::Idle,
            claimed: false,
        }
    }

    pub fn id(&self) -> PumpId {
        self.id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Register with the coordinator and start contending for the category
    /// lease.
    ///
    /// Returns `false` on any failure path — duplicate category in this
    /// process, rejected registration, coordinator unreachable — and never
    /// panics for those. The upstream connection itself may come up later,
    /// whenever this pump wins an election.
    pub fn start(&mut self) -> bool {
        if self.status != PumpStatus::Idle {
            return false;
        }
        let Some(driver) = self.driver.take() else {
            return false;
        };

        if !claim_category(&self.category) {
            warn!(category = %self.category, "a pump for this category already exists here");
            self.driver = Some(driver);
            return false;
        }
        self.claimed = true;

        let registered = self.rpc.call(Command::PumpRegister {
            id: self.id,
            mode: self.mode,
            category: self.category.clone(),
        });
        match registered {
            Ok(Reply::Registered(true)) => {}
            Ok(_) => {
                warn!(pump = %self.id, category = %self.category, "registration rejected");
                return self.rollback_start(driver);
            }
            Err(err) => {
                warn!(pump = %self.id, error = %err, "registration failed");
                return self.rollback_start(driver);
            }
        }

        let transport = RaftChannel {
            rpc: Arc::clone(&self.rpc),
            category: self.category.clone(),
        };
        self.actor = Some(Actor::spawn(
            Box::new(transport),
            Box::new(DriverHooks { driver }),
            &self.raft_config,
        ));
        self.status = PumpStatus::Working;
        true
    }

    fn rollback_start(&mut self, driver: Box<dyn PumpDriver>) -> bool {
        release_category(&self.category);
        self.claimed = false;
        self.driver = Some(driver);
        false
    }

    /// Whether this pump currently holds the category lease.
    pub fn is_leader(&self) -> bool {
        self.actor.as_ref().is_some_and(Actor::is_leader)
    }

    /// Publish a message under a topic. A no-op unless this pump is
    /// currently the category leader; the coordinator additionally fences
    /// off publishes from a leadership this pump has already lost.
    pub fn pump(&self, topic: impl Into<String>, data: Value) {
        let Some(actor) = &self.actor else {
            return;
        };
        if !actor.is_leader() {
            return;
        }
        actor.publish(BroadcastMessage {
            topic: topic.into(),
            data,
        });
    }

    /// Close the pump and, if it holds the lease, the upstream connection.
    /// Terminal and idempotent; also run on drop.
    pub fn stop(&mut self) {
        if self.status == PumpStatus::Closed {
            return;
        }
        if let Some(mut actor) = self.actor.take() {
            actor.stop();
        }
        self.rpc.notify(Command::PumpClose {
            id: self.id,
            category: self.category.clone(),
        });
        self.rpc.close();
        if self.claimed {
            release_category(&self.category);
            self.claimed = false;
        }
        self.status = PumpStatus::Closed;
        debug!(pump = %self.id, category = %self.category, "pump closed");
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Election traffic for one category, carried over the pump's endpoint.
struct RaftChannel {
    rpc: Arc<RpcEndpoint>,
    category: String,
}

impl LeaseTransport for RaftChannel {
    fn elect(&self, request: ElectRequest) -> Result<ElectReply, RpcError> {
        let reply = self.rpc.call(Command::PumpRaftElect {
            category: self.category.clone(),
            term: request.term,
            candidate_id: request.candidate_id,
        })?;
        match reply {
            Reply::Elect(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply, RpcError> {
        let reply = self.rpc.call(Command::PumpRaftHeartbeat {
            category: self.category.clone(),
            term: request.term,
        })?;
        match reply {
            Reply::Heartbeat(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    fn messaging(&self, request: MessagingRequest) -> Result<(), RpcError> {
        self.rpc.notify(Command::PumpRaftMessaging {
            category: self.category.clone(),
            leader_id: request.leader_id,
            message: request.message,
        });
        Ok(())
    }
}

struct DriverHooks {
    driver: Box<dyn PumpDriver>,
}

impl LeaseHooks for DriverHooks {
    fn on_acquired(&mut self) -> bool {
        self.driver.connect()
    }

    fn on_released(&mut self) {
        self.driver.disconnect()
    }
}
