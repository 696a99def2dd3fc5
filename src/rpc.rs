//! Correlated request/response over a channel endpoint.
//!
//! One `RpcEndpoint` wraps one channel. Outbound traffic is either a
//! `call` (assigns an ack, parks the caller until the matching reply or a
//! timeout) or a `notify` (fire-and-forget, no bookkeeping). Inbound calls
//! are dispatched to a settable handler on a per-endpoint thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::debug;

use crate::channel::Channel;
use crate::config::RpcConfig;
use crate::protocol::{Command, Envelope, EnvelopeBody, Reply};

/// RPC-layer errors.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RpcError {
    /// No reply arrived within the configured window.
    #[error("rpc call timed out")]
    Timeout,

    /// The endpoint was closed (or the peer hung up) while the call was
    /// outstanding.
    #[error("rpc endpoint closed")]
    Closed,

    /// The peer replied with a payload of the wrong shape.
    #[error("unexpected reply payload")]
    UnexpectedReply,

    #[error("rpc state lock poisoned")]
    LockPoisoned,
}

/// Handler invoked for every inbound call.
pub type Handler = Box<dyn FnMut(Command, Responder) + Send>;

/// One-shot reply capability handed to the inbound-call handler.
///
/// Dropping it without sending is allowed; fire-and-forget senders never
/// look for the reply.
pub struct Responder {
    ack: u64,
    shared: Arc<Shared>,
}

impl Responder {
    /// Send the reply correlated to the originating call.
    pub fn send(self, reply: Reply) {
        self.shared.post(Envelope {
            ack: self.ack,
            body: EnvelopeBody::Reply(reply),
        });
    }
}

struct Shared {
    channel: Mutex<Box<dyn Channel>>,
    pending: Mutex<HashMap<u64, Sender<Reply>>>,
    handler: Mutex<Option<Handler>>,
    on_hangup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
}

impl Shared {
    fn post(&self, envelope: Envelope) {
        if let Ok(channel) = self.channel.lock() {
            channel.post(envelope);
        }
    }

    /// Drop all pending reply slots, waking every waiting caller with
    /// a disconnect.
    fn fail_outstanding(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

/// A correlated call/reply endpoint over one channel.
pub struct RpcEndpoint {
    shared: Arc<Shared>,
    next_ack: AtomicU64,
    timeout: Duration,
    shutdown: Sender<()>,
}

impl RpcEndpoint {
    /// Wrap a channel endpoint and start dispatching its inbound traffic.
    pub fn new(mut channel: Box<dyn Channel>, config: &RpcConfig) -> Self {
        channel.connect();
        let incoming = channel.incoming();

        let shared = Arc::new(Shared {
            channel: Mutex::new(channel),
            pending: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            on_hangup: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = unbounded();
        {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_dispatch(shared, incoming, shutdown_rx));
        }

        Self {
            shared,
            next_ack: AtomicU64::new(0),
            timeout: config.call_timeout(),
            shutdown: shutdown_tx,
        }
    }

    /// Install the inbound-call handler. Without one, inbound calls are
    /// dropped.
    pub fn set_handler(&self, handler: impl FnMut(Command, Responder) + Send + 'static) {
        if let Ok(mut slot) = self.shared.handler.lock() {
            *slot = Some(Box::new(handler));
        }
    }

    /// Install a callback fired once when the peer hangs up. Not fired on
    /// a local [`close`](Self::close).
    pub fn set_on_hangup(&self, on_hangup: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.shared.on_hangup.lock() {
            *slot = Some(Box::new(on_hangup));
        }
    }

    /// Send a command and wait for the correlated reply.
    ///
    /// Settles with whichever comes first: the matching reply, the
    /// configured timeout, or endpoint closure. Either way the correlation
    /// entry is released; a reply arriving after that is dropped.
    pub fn call(&self, command: Command) -> Result<Reply, RpcError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }

        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = bounded(1);
        self.shared
            .pending
            .lock()
            .map_err(|_| RpcError::LockPoisoned)?
            .insert(ack, reply_tx);

        self.shared.post(Envelope {
            ack,
            body: EnvelopeBody::Call(command),
        });

        match reply_rx.recv_timeout(self.timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&ack);
                }
                Err(RpcError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Closed),
        }
    }

    /// Fire-and-forget send: assigns an ack for wire uniformity but creates
    /// no bookkeeping, so an unsolicited reply to it is dropped on arrival.
    pub fn notify(&self, command: Command) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        self.shared.post(Envelope {
            ack,
            body: EnvelopeBody::Call(command),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear the endpoint down. Idempotent.
    ///
    /// Outstanding calls fail with [`RpcError::Closed`] rather than being
    /// left to time out; the handler and hangup callback are dropped and the
    /// underlying channel is disconnected.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut handler) = self.shared.handler.lock() {
            *handler = None;
        }
        if let Ok(mut on_hangup) = self.shared.on_hangup.lock() {
            *on_hangup = None;
        }
        let _ = self.shutdown.send(());
        self.shared.fail_outstanding();
        if let Ok(mut channel) = self.shared.channel.lock() {
            channel.disconnect();
        }
    }
}

impl Drop for RpcEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_dispatch(shared: Arc<Shared>, incoming: Receiver<Envelope>, shutdown: Receiver<()>) {
    let hangup = loop {
        crossbeam::select! {
            recv(incoming) -> msg => match msg {
                Ok(envelope) => handle_envelope(&shared, envelope),
                Err(_) => break true,
            },
            recv(shutdown) -> _ => break false,
        }
    };

    shared.closed.store(true, Ordering::Release);
    shared.fail_outstanding();
    if let Ok(mut handler) = shared.handler.lock() {
        *handler = None;
    }

    if hangup {
        let on_hangup = shared.on_hangup.lock().ok().and_then(|mut slot| slot.take());
        if let Some(on_hangup) = on_hangup {
            on_hangup();
        }
    }
}

fn handle_envelope(shared: &Arc<Shared>, envelope: Envelope) {
    match envelope.body {
        EnvelopeBody::Reply(reply) => {
            let slot = shared
                .pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&envelope.ack));
            match slot {
                Some(reply_tx) => {
                    let _ = reply_tx.send(reply);
                }
                None => debug!(ack = envelope.ack, "dropping reply for unknown ack"),
            }
        }
        EnvelopeBody::Call(command) => {
            let responder = Responder {
                ack: envelope.ack,
                shared: Arc::clone(shared),
            };
            if let Ok(mut slot) = shared.handler.lock() {
                match slot.as_mut() {
                    Some(handler) => handler(command, responder),
                    None => debug!(ack = envelope.ack, "dropping inbound call: no handler"),
                }
            }
        }
    }
}
