//! Channel contract and the in-process loopback transport.
//!
//! A channel is a duplex endpoint moving envelopes between one client and
//! the coordinator. Sends are best-effort; the inbound side is exposed as a
//! receiver that disconnects when the peer hangs up.

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::protocol::Envelope;

/// Duplex endpoint contract consumed by the RPC layer.
///
/// Implementations outside this crate can bridge sockets, shared memory or
/// anything else that can carry serialized envelopes (see
/// [`encode_envelope`](crate::protocol::encode_envelope)).
pub trait Channel: Send {
    /// Bring the endpoint up. Idempotent; may be a no-op for endpoints that
    /// are born wired, like the loopback pair.
    fn connect(&mut self);

    /// Release the underlying resource and hang up on the peer. Idempotent.
    fn disconnect(&mut self);

    /// Best-effort send. Posts to a disconnected peer are silently dropped.
    fn post(&self, envelope: Envelope);

    /// Inbound envelope stream. The receiver disconnects once the peer hangs
    /// up and all in-flight envelopes have been drained.
    fn incoming(&self) -> Receiver<Envelope>;
}

/// In-process duplex endpoint; both halves of a [`pair`] are born connected.
#[derive(Debug)]
pub struct Loopback {
    tx: Option<Sender<Envelope>>,
    rx: Receiver<Envelope>,
}

/// Create a connected pair of in-process endpoints.
pub fn pair() -> (Loopback, Loopback) {
    let (left_tx, left_rx) = unbounded();
    let (right_tx, right_rx) = unbounded();
    (
        Loopback {
            tx: Some(left_tx),
            rx: right_rx,
        },
        Loopback {
            tx: Some(right_tx),
            rx: left_rx,
        },
    )
}

impl Channel for Loopback {
    fn connect(&mut self) {}

    fn disconnect(&mut self) {
        self.tx = None;
    }

    fn post(&self, envelope: Envelope) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(envelope);
        }
    }

    fn incoming(&self) -> Receiver<Envelope> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::RecvError;

    use super::*;
    use crate::protocol::{Command, EnvelopeBody};

    fn ping(ack: u64) -> Envelope {
        Envelope {
            ack,
            body: EnvelopeBody::Call(Command::Ping),
        }
    }

    #[test]
    fn posts_cross_the_pair() {
        let (left, right) = pair();
        left.post(ping(1));
        right.post(ping(2));

        assert_eq!(right.incoming().recv().unwrap().ack, 1);
        assert_eq!(left.incoming().recv().unwrap().ack, 2);
    }

    #[test]
    fn disconnect_hangs_up_the_peer() {
        let (mut left, right) = pair();
        left.post(ping(1));
        left.disconnect();

        let incoming = right.incoming();
        assert_eq!(incoming.recv().unwrap().ack, 1);
        assert_eq!(incoming.recv(), Err(RecvError));
    }

    #[test]
    fn post_after_disconnect_is_dropped() {
        let (mut left, _right) = pair();
        left.disconnect();
        left.post(ping(1));
    }
}
