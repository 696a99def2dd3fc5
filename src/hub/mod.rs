//! Coordinator: one state loop owning the registries.
//!
//! Every client connection feeds inbound commands into the hub's request
//! channel; a single state thread consumes them sequentially. That thread
//! is THE serialization point — pump registrations, category dealers and
//! the broker are mutated nowhere else.

mod broker;
mod pumps;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::debug;

pub use broker::{Broker, TopicError};
pub use pumps::PumpRegistry;

use crate::channel::{self, Loopback};
use crate::config::Config;
use crate::protocol::{Command, Reply};
use crate::raft::{ElectRequest, HeartbeatRequest};
use crate::rpc::{Responder, RpcEndpoint};

/// Identity of one client connection, scoped to its hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

enum HubRequest {
    Connected { conn: ConnId, rpc: Arc<RpcEndpoint> },
    Call {
        conn: ConnId,
        command: Command,
        responder: Responder,
    },
    Hangup { conn: ConnId },
    Shutdown,
}

/// The shared coordinator.
///
/// Constructed at startup, torn down with [`shutdown`](Self::shutdown) (or
/// drop); registries and category terms live exactly as long as the hub.
pub struct Hub {
    config: Config,
    requests: Sender<HubRequest>,
    next_conn: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl Hub {
    pub fn new(config: Config) -> Self {
        let (requests, inbox) = unbounded();
        let thread = {
            let config = config.clone();
            thread::spawn(move || run_hub_loop(config, inbox))
        };
        Self {
            config,
            requests,
            next_conn: AtomicU64::new(1),
            thread: Some(thread),
        }
    }

    /// Open a client connection. The returned endpoint plugs into a
    /// [`Pump`](crate::pump::Pump), a [`Pipe`](crate::pipe::Pipe), or a bare
    /// [`RpcEndpoint`].
    ///
    /// Closing (or dropping) the returned endpoint hangs the connection up,
    /// which implicitly removes every registration it owns.
    pub fn connect(&self) -> Loopback {
        let (client_end, hub_end) = channel::pair();
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let rpc = Arc::new(RpcEndpoint::new(Box::new(hub_end), &self.config.rpc));

        {
            let requests = self.requests.clone();
            rpc.set_handler(move |command, responder| {
                let _ = requests.send(HubRequest::Call {
                    conn,
                    command,
                    responder,
                });
            });
        }
        {
            let requests = self.requests.clone();
            rpc.set_on_hangup(move || {
                let _ = requests.send(HubRequest::Hangup { conn });
            });
        }

        let _ = self.requests.send(HubRequest::Connected { conn, rpc });
        client_end
    }

    /// Stop the state loop and close every connection. Idempotent; also run
    /// on drop.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.requests.send(HubRequest::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_hub_loop(config: Config, inbox: Receiver<HubRequest>) {
    let mut conns: BTreeMap<ConnId, Arc<RpcEndpoint>> = BTreeMap::new();
    let mut pumps = PumpRegistry::new(config.limits);
    let mut broker = Broker::new(config.limits);

    while let Ok(request) = inbox.recv() {
        match request {
            HubRequest::Connected { conn, rpc } => {
                debug!(%conn, "connection opened");
                conns.insert(conn, rpc);
            }
            HubRequest::Hangup { conn } => {
                debug!(%conn, "connection hung up");
                conns.remove(&conn);
                pumps.drop_connection(conn);
                broker.drop_connection(conn);
            }
            HubRequest::Call {
                conn,
                command,
                responder,
            } => handle_command(conn, command, responder, &conns, &mut pumps, &mut broker),
            HubRequest::Shutdown => break,
        }
    }

    for rpc in conns.into_values() {
        rpc.close();
    }
}

fn handle_command(
    conn: ConnId,
    command: Command,
    responder: Responder,
    conns: &BTreeMap<ConnId, Arc<RpcEndpoint>>,
    pumps: &mut PumpRegistry,
    broker: &mut Broker,
) {
    match command {
        Command::Ping => responder.send(Reply::Pong { pong: true }),

        Command::PumpRegister { id, mode, category } => {
            let accepted = pumps.register(id, conn, category, mode);
            responder.send(Reply::Registered(accepted));
        }

        Command::PumpClose { id, category: _ } => pumps.close(id),

        Command::PumpRaftElect {
            category,
            term,
            candidate_id,
        } => {
            let reply = pumps
                .dealer(&category)
                .request_elect(ElectRequest { term, candidate_id });
            responder.send(Reply::Elect(reply));
        }

        Command::PumpRaftHeartbeat { category, term } => {
            let reply = pumps
                .dealer(&category)
                .request_heartbeat(HeartbeatRequest { term });
            responder.send(Reply::Heartbeat(reply));
        }

        Command::PumpRaftMessaging {
            category,
            leader_id,
            message,
        } => {
            if pumps.dealer(&category).request_messaging(leader_id) {
                broker.broadcast(&message);
            } else {
                debug!(%category, leader = %leader_id, "dropping publish from superseded leader");
            }
        }

        Command::PipeRegister { id, topic } => {
            let accepted = match conns.get(&conn) {
                Some(rpc) => broker.register(id, conn, topic.as_ref(), Arc::clone(rpc)),
                None => false,
            };
            responder.send(Reply::Registered(accepted));
        }

        Command::PipeClose { id } => broker.unregister(id),

        // Subscriber pushes flow hub -> client only.
        Command::PipeReceive { .. } => debug!(%conn, "ignoring pipe_receive sent to the hub"),
    }
}
