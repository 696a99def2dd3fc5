//! Leader election: a per-category lease fenced by a monotone term.
//!
//! Client side, an [`Actor`] contends for the lease and, once it wins,
//! renews it with heartbeats. Coordinator side, a [`Dealer`] arbitrates:
//! it grants elections and accepts heartbeats only for terms strictly
//! greater than the one it has recorded, so two contenders can never both
//! believe they hold the lease, however their requests interleave.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, at, unbounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RaftConfig;
use crate::protocol::{ActorId, BroadcastMessage};
use crate::rpc::RpcError;

// =============================================================================
// Term
// =============================================================================

/// Per-category monotone counter ordering election, heartbeat and publish
/// requests.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0.saturating_add(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Requests and replies
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectRequest {
    pub term: Term,
    pub candidate_id: ActorId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectReply {
    pub is_granted: bool,
    pub term: Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub term: Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub is_expired: bool,
    pub term: Term,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessagingRequest {
    pub leader_id: ActorId,
    pub message: BroadcastMessage,
}

// =============================================================================
// Capability interfaces
// =============================================================================

/// Carries an actor's election traffic to the coordinator.
pub trait LeaseTransport: Send {
    fn elect(&self, request: ElectRequest) -> Result<ElectReply, RpcError>;
    fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply, RpcError>;
    fn messaging(&self, request: MessagingRequest) -> Result<(), RpcError>;
}

/// Owner actions run on lease transitions.
pub trait LeaseHooks: Send {
    /// Bring the owned resource up. Returning `false` rolls the actor
    /// straight back to contention without a matching [`on_released`].
    ///
    /// [`on_released`]: Self::on_released
    fn on_acquired(&mut self) -> bool;

    /// Tear the owned resource down. Invoked only after a successful
    /// [`on_acquired`](Self::on_acquired).
    fn on_released(&mut self);
}

// =============================================================================
// Dealer
// =============================================================================

/// Coordinator-side lease authority for one category.
///
/// Created lazily on the first election request for a category and kept for
/// the coordinator's lifetime; nothing is persisted across restarts.
#[derive(Debug, Default)]
pub struct Dealer {
    term: Term,
    leader_id: Option<ActorId>,
}

impl Dealer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader_id(&self) -> Option<ActorId> {
        self.leader_id
    }

    /// Grant the lease iff the request's term is strictly newer than the
    /// recorded one. A denial echoes the recorded term so the candidate can
    /// resynchronize.
    pub fn request_elect(&mut self, request: ElectRequest) -> ElectReply {
        if request.term > self.term {
            self.term = request.term;
            self.leader_id = Some(request.candidate_id);
            ElectReply {
                is_granted: true,
                term: request.term,
            }
        } else {
            ElectReply {
                is_granted: false,
                term: self.term,
            }
        }
    }

    /// Renew the lease iff the request's term is strictly newer. A stale
    /// term means another candidate won an election this sender missed, so
    /// the reply forces it to step down. Never touches the leader id.
    pub fn request_heartbeat(&mut self, request: HeartbeatRequest) -> HeartbeatReply {
        if request.term > self.term {
            self.term = request.term;
            HeartbeatReply {
                is_expired: false,
                term: request.term,
            }
        } else {
            HeartbeatReply {
                is_expired: true,
                term: self.term,
            }
        }
    }

    /// Whether a publish carrying this leader id is still authoritative.
    /// Fences off leaders that have been superseded but have not yet
    /// learned they lost the lease.
    pub fn request_messaging(&self, leader_id: ActorId) -> bool {
        self.leader_id == Some(leader_id)
    }
}

// =============================================================================
// Actor
// =============================================================================

enum ActorCtrl {
    Publish(BroadcastMessage),
    Stepdown,
    Stop,
}

/// Client-side election participant for one category.
///
/// Runs its own loop thread: an immediate election attempt on spawn, then
/// rounds self-scheduled at the election interval while a candidate and the
/// heartbeat interval while the leader. Every round increments the local
/// term before sending and adopts the dealer's returned term afterwards,
/// so a denied or expired actor resynchronizes to the authoritative term.
pub struct Actor {
    id: ActorId,
    is_leader: Arc<AtomicBool>,
    ctrl: Sender<ActorCtrl>,
    thread: Option<JoinHandle<()>>,
}

impl Actor {
    pub fn spawn(
        transport: Box<dyn LeaseTransport>,
        hooks: Box<dyn LeaseHooks>,
        config: &RaftConfig,
    ) -> Self {
        let id = ActorId::generate();
        let is_leader = Arc::new(AtomicBool::new(false));
        let (ctrl_tx, ctrl_rx) = unbounded();

        let thread = {
            let config = config.clone();
            let is_leader = Arc::clone(&is_leader);
            thread::spawn(move || run_actor_loop(id, transport, hooks, config, ctrl_rx, is_leader))
        };

        Self {
            id,
            is_leader,
            ctrl: ctrl_tx,
            thread: Some(thread),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Publish through the lease. Ignored unless the actor currently holds
    /// it; the message is tagged with the actor's own id so the coordinator
    /// can fence stale publishers.
    pub fn publish(&self, message: BroadcastMessage) {
        let _ = self.ctrl.send(ActorCtrl::Publish(message));
    }

    /// Voluntarily fall back to contention, releasing the owned resource.
    pub fn stepdown(&self) {
        let _ = self.ctrl.send(ActorCtrl::Stepdown);
    }

    /// Terminal: release the lease if held and stop the loop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.ctrl.send(ActorCtrl::Stop);
            let _ = thread.join();
        }
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Candidate,
    Leader,
}

struct ActorState {
    id: ActorId,
    term: Term,
    status: Status,
    is_leader: Arc<AtomicBool>,
}

impl ActorState {
    fn new(id: ActorId, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            id,
            term: Term::ZERO,
            status: Status::Candidate,
            is_leader,
        }
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
        self.is_leader
            .store(status == Status::Leader, Ordering::Release);
    }

    fn election_round(&mut self, transport: &dyn LeaseTransport, hooks: &mut dyn LeaseHooks) {
        self.term = self.term.next();
        let request = ElectRequest {
            term: self.term,
            candidate_id: self.id,
        };
        match transport.elect(request) {
            Ok(reply) => {
                if reply.is_granted {
                    if hooks.on_acquired() {
                        self.set_status(Status::Leader);
                        debug!(actor = %self.id, term = %reply.term, "lease acquired");
                    } else {
                        // The upstream never came up, so there is nothing to
                        // release; the lease lapses at the next election.
                        warn!(actor = %self.id, term = %reply.term, "connect failed, retrying");
                    }
                }
                self.term = reply.term;
            }
            Err(err) => {
                warn!(actor = %self.id, error = %err, "election request failed");
            }
        }
    }

    fn heartbeat_round(&mut self, transport: &dyn LeaseTransport, hooks: &mut dyn LeaseHooks) {
        self.term = self.term.next();
        match transport.heartbeat(HeartbeatRequest { term: self.term }) {
            Ok(reply) => {
                if reply.is_expired {
                    debug!(actor = %self.id, term = %reply.term, "lease expired");
                    self.step_down(hooks);
                }
                self.term = reply.term;
            }
            Err(err) => {
                // The lease cannot be confirmed; release rather than risk
                // two live upstreams.
                warn!(actor = %self.id, error = %err, "heartbeat failed, releasing lease");
                self.step_down(hooks);
            }
        }
    }

    fn step_down(&mut self, hooks: &mut dyn LeaseHooks) {
        if self.status == Status::Leader {
            self.set_status(Status::Candidate);
            hooks.on_released();
        }
    }

    fn publish(&self, transport: &dyn LeaseTransport, message: BroadcastMessage) {
        if self.status != Status::Leader {
            return;
        }
        let request = MessagingRequest {
            leader_id: self.id,
            message,
        };
        if let Err(err) = transport.messaging(request) {
            warn!(actor = %self.id, error = %err, "publish failed");
        }
    }
}

fn run_actor_loop(
    id: ActorId,
    transport: Box<dyn LeaseTransport>,
    mut hooks: Box<dyn LeaseHooks>,
    config: RaftConfig,
    ctrl: Receiver<ActorCtrl>,
    is_leader: Arc<AtomicBool>,
) {
    let mut state = ActorState::new(id, is_leader);

    // Contend right away; the scheduled cadence starts after this round.
    state.election_round(transport.as_ref(), hooks.as_mut());

    loop {
        let interval = match state.status {
            Status::Leader => config.heartbeat_interval(),
            Status::Candidate => config.election_interval(),
        };
        let deadline = Instant::now() + interval;

        let fired = 'wait: loop {
            crossbeam::select! {
                recv(ctrl) -> msg => match msg {
                    Ok(ActorCtrl::Publish(message)) => {
                        state.publish(transport.as_ref(), message);
                    }
                    Ok(ActorCtrl::Stepdown) => {
                        state.step_down(hooks.as_mut());
                        break 'wait false;
                    }
                    Ok(ActorCtrl::Stop) | Err(_) => {
                        state.step_down(hooks.as_mut());
                        return;
                    }
                },
                recv(at(deadline)) -> _ => break 'wait true,
            }
        };

        if fired {
            match state.status {
                Status::Candidate => state.election_round(transport.as_ref(), hooks.as_mut()),
                Status::Leader => state.heartbeat_round(transport.as_ref(), hooks.as_mut()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn actor_id(byte: u8) -> ActorId {
        ActorId::new(Uuid::from_bytes([byte; 16]))
    }

    fn message(topic: &str) -> BroadcastMessage {
        BroadcastMessage {
            topic: topic.to_string(),
            data: json!(1),
        }
    }

    // =========================================================================
    // Dealer
    // =========================================================================

    #[test]
    fn elect_requires_strictly_newer_term() {
        let mut dealer = Dealer::new();
        let a = actor_id(0xaa);
        let b = actor_id(0xbb);

        let reply = dealer.request_elect(ElectRequest {
            term: Term(1),
            candidate_id: a,
        });
        assert_eq!(
            reply,
            ElectReply {
                is_granted: true,
                term: Term(1)
            }
        );
        assert_eq!(dealer.leader_id(), Some(a));

        // Same term, different candidate: denied, state unchanged.
        let reply = dealer.request_elect(ElectRequest {
            term: Term(1),
            candidate_id: b,
        });
        assert_eq!(
            reply,
            ElectReply {
                is_granted: false,
                term: Term(1)
            }
        );
        assert_eq!(dealer.leader_id(), Some(a));

        let reply = dealer.request_elect(ElectRequest {
            term: Term(2),
            candidate_id: b,
        });
        assert_eq!(
            reply,
            ElectReply {
                is_granted: true,
                term: Term(2)
            }
        );
        assert_eq!(dealer.leader_id(), Some(b));
    }

    #[test]
    fn leader_tracks_greatest_accepted_term() {
        let mut dealer = Dealer::new();
        let mut winner = None;
        for byte in 1..=5u8 {
            let id = actor_id(byte);
            let reply = dealer.request_elect(ElectRequest {
                term: Term(u64::from(byte % 3)),
                candidate_id: id,
            });
            if reply.is_granted {
                winner = Some((id, reply.term));
            }
        }
        let (id, term) = winner.unwrap();
        assert_eq!(dealer.leader_id(), Some(id));
        assert_eq!(dealer.term(), term);
    }

    #[test]
    fn stale_heartbeat_expires_without_mutation() {
        let mut dealer = Dealer::new();
        let a = actor_id(0xaa);
        dealer.request_elect(ElectRequest {
            term: Term(3),
            candidate_id: a,
        });

        for stale in [Term(1), Term(3)] {
            let reply = dealer.request_heartbeat(HeartbeatRequest { term: stale });
            assert_eq!(
                reply,
                HeartbeatReply {
                    is_expired: true,
                    term: Term(3)
                }
            );
            assert_eq!(dealer.term(), Term(3));
            assert_eq!(dealer.leader_id(), Some(a));
        }

        let reply = dealer.request_heartbeat(HeartbeatRequest { term: Term(4) });
        assert_eq!(
            reply,
            HeartbeatReply {
                is_expired: false,
                term: Term(4)
            }
        );
        assert_eq!(dealer.leader_id(), Some(a));
    }

    #[test]
    fn messaging_is_fenced_to_the_recorded_leader() {
        let mut dealer = Dealer::new();
        let a = actor_id(0xaa);
        let b = actor_id(0xbb);

        assert!(!dealer.request_messaging(a));

        dealer.request_elect(ElectRequest {
            term: Term(2),
            candidate_id: a,
        });
        assert!(dealer.request_messaging(a));

        dealer.request_elect(ElectRequest {
            term: Term(3),
            candidate_id: b,
        });
        assert!(!dealer.request_messaging(a));
        assert!(dealer.request_messaging(b));
        assert_eq!(dealer.term(), Term(3));
    }

    // =========================================================================
    // Actor state machine, driven directly with fakes
    // =========================================================================

    #[derive(Debug, PartialEq)]
    enum Sent {
        Elect(ElectRequest),
        Heartbeat(HeartbeatRequest),
        Messaging(MessagingRequest),
    }

    struct FakeTransport {
        elect_replies: RefCell<Vec<Result<ElectReply, RpcError>>>,
        heartbeat_replies: RefCell<Vec<Result<HeartbeatReply, RpcError>>>,
        sent: RefCell<Vec<Sent>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                elect_replies: RefCell::new(Vec::new()),
                heartbeat_replies: RefCell::new(Vec::new()),
                sent: RefCell::new(Vec::new()),
            }
        }

        fn push_elect(&self, reply: Result<ElectReply, RpcError>) {
            self.elect_replies.borrow_mut().push(reply);
        }

        fn push_heartbeat(&self, reply: Result<HeartbeatReply, RpcError>) {
            self.heartbeat_replies.borrow_mut().push(reply);
        }
    }

    impl LeaseTransport for FakeTransport {
        fn elect(&self, request: ElectRequest) -> Result<ElectReply, RpcError> {
            self.sent.borrow_mut().push(Sent::Elect(request));
            self.elect_replies.borrow_mut().remove(0)
        }

        fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply, RpcError> {
            self.sent.borrow_mut().push(Sent::Heartbeat(request));
            self.heartbeat_replies.borrow_mut().remove(0)
        }

        fn messaging(&self, request: MessagingRequest) -> Result<(), RpcError> {
            self.sent.borrow_mut().push(Sent::Messaging(request));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeHooks {
        connect_result: bool,
        acquired: usize,
        released: usize,
    }

    impl LeaseHooks for FakeHooks {
        fn on_acquired(&mut self) -> bool {
            self.acquired += 1;
            self.connect_result
        }

        fn on_released(&mut self) {
            self.released += 1;
        }
    }

    fn state() -> ActorState {
        ActorState::new(actor_id(0x11), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn granted_election_acquires_the_lease() {
        let transport = FakeTransport::new();
        transport.push_elect(Ok(ElectReply {
            is_granted: true,
            term: Term(1),
        }));
        let mut hooks = FakeHooks {
            connect_result: true,
            ..FakeHooks::default()
        };

        let mut state = state();
        state.election_round(&transport, &mut hooks);

        assert_eq!(state.status, Status::Leader);
        assert!(state.is_leader.load(Ordering::Acquire));
        assert_eq!(hooks.acquired, 1);
        assert_eq!(hooks.released, 0);
        assert_eq!(
            transport.sent.borrow()[0],
            Sent::Elect(ElectRequest {
                term: Term(1),
                candidate_id: state.id,
            })
        );
    }

    #[test]
    fn failed_connect_rolls_back_without_release() {
        let transport = FakeTransport::new();
        transport.push_elect(Ok(ElectReply {
            is_granted: true,
            term: Term(1),
        }));
        let mut hooks = FakeHooks::default(); // connect_result: false

        let mut state = state();
        state.election_round(&transport, &mut hooks);

        assert_eq!(state.status, Status::Candidate);
        assert!(!state.is_leader.load(Ordering::Acquire));
        assert_eq!(hooks.acquired, 1);
        assert_eq!(hooks.released, 0);
    }

    #[test]
    fn denied_election_adopts_the_authoritative_term() {
        let transport = FakeTransport::new();
        transport.push_elect(Ok(ElectReply {
            is_granted: false,
            term: Term(9),
        }));
        let mut hooks = FakeHooks::default();

        let mut state = state();
        state.election_round(&transport, &mut hooks);

        assert_eq!(state.status, Status::Candidate);
        assert_eq!(state.term, Term(9));
        assert_eq!(hooks.acquired, 0);
    }

    #[test]
    fn expired_heartbeat_releases_the_lease() {
        let transport = FakeTransport::new();
        transport.push_elect(Ok(ElectReply {
            is_granted: true,
            term: Term(1),
        }));
        transport.push_heartbeat(Ok(HeartbeatReply {
            is_expired: true,
            term: Term(5),
        }));
        let mut hooks = FakeHooks {
            connect_result: true,
            ..FakeHooks::default()
        };

        let mut state = state();
        state.election_round(&transport, &mut hooks);
        state.heartbeat_round(&transport, &mut hooks);

        assert_eq!(state.status, Status::Candidate);
        assert_eq!(state.term, Term(5));
        assert_eq!(hooks.released, 1);
    }

    #[test]
    fn heartbeat_failure_releases_the_lease() {
        let transport = FakeTransport::new();
        transport.push_elect(Ok(ElectReply {
            is_granted: true,
            term: Term(1),
        }));
        transport.push_heartbeat(Err(RpcError::Timeout));
        let mut hooks = FakeHooks {
            connect_result: true,
            ..FakeHooks::default()
        };

        let mut state = state();
        state.election_round(&transport, &mut hooks);
        state.heartbeat_round(&transport, &mut hooks);

        assert_eq!(state.status, Status::Candidate);
        assert_eq!(hooks.released, 1);
    }

    #[test]
    fn election_failure_keeps_contending() {
        let transport = FakeTransport::new();
        transport.push_elect(Err(RpcError::Timeout));
        let mut hooks = FakeHooks::default();

        let mut state = state();
        state.election_round(&transport, &mut hooks);

        assert_eq!(state.status, Status::Candidate);
        assert_eq!(state.term, Term(1));
        assert_eq!(hooks.acquired, 0);
    }

    #[test]
    fn publish_is_dropped_unless_leader() {
        let transport = FakeTransport::new();
        transport.push_elect(Ok(ElectReply {
            is_granted: true,
            term: Term(1),
        }));
        let mut hooks = FakeHooks {
            connect_result: true,
            ..FakeHooks::default()
        };

        let mut state = state();
        state.publish(&transport, message("ignored"));
        assert!(transport.sent.borrow().is_empty());

        state.election_round(&transport, &mut hooks);
        state.publish(&transport, message("delivered"));

        let sent = transport.sent.borrow();
        assert_eq!(
            sent[1],
            Sent::Messaging(MessagingRequest {
                leader_id: state.id,
                message: message("delivered"),
            })
        );
        // Publishing never advances the term.
        assert_eq!(state.term, Term(1));
    }

    // =========================================================================
    // Actor loop thread
    // =========================================================================

    struct GrantingTransport;

    impl LeaseTransport for GrantingTransport {
        fn elect(&self, request: ElectRequest) -> Result<ElectReply, RpcError> {
            Ok(ElectReply {
                is_granted: true,
                term: request.term,
            })
        }

        fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatReply, RpcError> {
            Ok(HeartbeatReply {
                is_expired: false,
                term: request.term,
            })
        }

        fn messaging(&self, _request: MessagingRequest) -> Result<(), RpcError> {
            Ok(())
        }
    }

    struct CountingHooks {
        counts: Arc<Mutex<(usize, usize)>>,
    }

    impl LeaseHooks for CountingHooks {
        fn on_acquired(&mut self) -> bool {
            self.counts.lock().unwrap().0 += 1;
            true
        }

        fn on_released(&mut self) {
            self.counts.lock().unwrap().1 += 1;
        }
    }

    #[test]
    fn stepdown_releases_and_the_actor_recontends() {
        let counts = Arc::new(Mutex::new((0, 0)));
        let config = RaftConfig {
            election_interval_ms: 20,
            heartbeat_interval_ms: 10,
        };
        let mut actor = Actor::spawn(
            Box::new(GrantingTransport),
            Box::new(CountingHooks {
                counts: Arc::clone(&counts),
            }),
            &config,
        );

        std::thread::sleep(Duration::from_millis(60));
        assert!(actor.is_leader());

        actor.stepdown();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(counts.lock().unwrap().1, 1);

        // With nobody else contending, the next election round wins the
        // lease back.
        std::thread::sleep(Duration::from_millis(100));
        assert!(actor.is_leader());
        assert_eq!(counts.lock().unwrap().0, 2);

        actor.stop();
    }

    #[test]
    fn spawned_actor_acquires_and_releases_on_stop() {
        let counts = Arc::new(Mutex::new((0, 0)));
        let config = RaftConfig {
            election_interval_ms: 20,
            heartbeat_interval_ms: 10,
        };
        let mut actor = Actor::spawn(
            Box::new(GrantingTransport),
            Box::new(CountingHooks {
                counts: Arc::clone(&counts),
            }),
            &config,
        );

        std::thread::sleep(Duration::from_millis(100));
        assert!(actor.is_leader());

        actor.stop();
        assert!(!actor.is_leader());
        let (acquired, released) = *counts.lock().unwrap();
        assert_eq!(acquired, 1);
        assert_eq!(released, 1);

        // Idempotent.
        actor.stop();
        let (acquired, released) = *counts.lock().unwrap();
        assert_eq!((acquired, released), (1, 1));
    }
}
