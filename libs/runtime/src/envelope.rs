//! Message envelopes, per-actor mailboxes, and the delivery fabric.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use actor_graph::{ActorId, MessageKey};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::ChannelError;
use crate::scheduler::Scheduler;

/// Correlation token for request/response style messaging. Unique per
/// caller and channel, allocated from the caller's call table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub(crate) u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// One in-flight message. Immutable after send.
pub struct Envelope {
    pub source: ActorId,
    /// Critical envelopes bypass the normal queue. Reserved for signals
    /// whose late delivery would be worse than reordering.
    pub critical: bool,
    pub payload: Payload,
}

/// The kind tag plus payload for every message family the runtime routes.
///
/// Dispatch is a match on this tag followed by a lookup on the payload's
/// runtime type; no open-generic machinery is involved.
pub enum Payload {
    /// Plain point-to-point or fan-out message.
    Net {
        key: MessageKey,
        data: Arc<dyn Any + Send + Sync>,
    },
    /// Pub/sub broadcast, shared across all subscribers.
    Event {
        key: MessageKey,
        data: Arc<dyn Any + Send + Sync>,
    },
    /// Event-channel control: add `subscriber` for `message`.
    Subscribe {
        subscriber: ActorId,
        message: MessageKey,
    },
    /// Event-channel control: drop `subscriber` for `message`.
    Unsubscribe {
        subscriber: ActorId,
        message: MessageKey,
    },
    /// Correlated request expecting exactly one reply.
    RpcRequest {
        key: MessageKey,
        call: CallId,
        data: Box<dyn Any + Send>,
    },
    RpcSuccess {
        call: CallId,
        data: Box<dyn Any + Send>,
    },
    RpcFailure {
        call: CallId,
        error: ChannelError,
    },
    /// Interception-chain frame travelling stage to stage.
    Pipe(PipeFrame),
}

/// The travelling state of one pipe chain invocation.
pub struct PipeFrame {
    pub key: MessageKey,
    pub call: CallId,
    /// The actor that pushed the chain; the frame returns here.
    pub origin: ActorId,
    /// Set when a stage failed; remaining stages are skipped.
    pub error: Option<ChannelError>,
    pub data: Box<dyn Any + Send>,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Net { key, .. } => write!(f, "Net({key})"),
            Payload::Event { key, .. } => write!(f, "Event({key})"),
            Payload::Subscribe { message, .. } => write!(f, "Subscribe({message})"),
            Payload::Unsubscribe { message, .. } => write!(f, "Unsubscribe({message})"),
            Payload::RpcRequest { key, call, .. } => write!(f, "RpcRequest({key}, {call})"),
            Payload::RpcSuccess { call, .. } => write!(f, "RpcSuccess({call})"),
            Payload::RpcFailure { call, error } => write!(f, "RpcFailure({call}, {error})"),
            Payload::Pipe(frame) => write!(f, "Pipe({}, {})", frame.key, frame.call),
        }
    }
}

/// Inbound queue pair of one actor. Senders push from any thread; only
/// the owning actor drains. Locks are held for the queue operation only,
/// never across a handler.
#[derive(Default)]
pub struct Mailbox {
    critical: Mutex<VecDeque<Envelope>>,
    normal: Mutex<VecDeque<Envelope>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: Envelope) {
        if envelope.critical {
            self.critical.lock().push_back(envelope);
        } else {
            self.normal.lock().push_back(envelope);
        }
    }

    /// Critical messages drain before normal ones; within a queue the
    /// order is the send order.
    pub fn pop(&self) -> Option<Envelope> {
        if let Some(envelope) = self.critical.lock().pop_front() {
            return Some(envelope);
        }
        self.normal.lock().pop_front()
    }

    pub fn has_critical(&self) -> bool {
        !self.critical.lock().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.critical.lock().is_empty() && self.normal.lock().is_empty()
    }
}

/// The actor-socket table: every actor's mailbox plus the scheduler used
/// to wake receivers. Built once at system construction and read-only
/// afterwards, so concurrent sends need no graph locking.
pub struct Fabric {
    mailboxes: HashMap<ActorId, Arc<Mailbox>>,
    scheduler: Arc<Scheduler>,
}

impl Fabric {
    pub(crate) fn new(mailboxes: HashMap<ActorId, Arc<Mailbox>>, scheduler: Arc<Scheduler>) -> Self {
        Self { mailboxes, scheduler }
    }

    /// Enqueues on the receiver's mailbox and wakes it. Never runs a
    /// handler synchronously on the sender's thread.
    pub fn deliver(&self, to: ActorId, envelope: Envelope) {
        match self.mailboxes.get(&to) {
            Some(mailbox) => {
                mailbox.push(envelope);
                self.scheduler.wake(to);
            }
            None => warn!(
                target = %to,
                payload = ?envelope.payload,
                "message for unknown actor discarded"
            ),
        }
    }

    pub(crate) fn mailbox(&self, id: ActorId) -> Option<Arc<Mailbox>> {
        self.mailboxes.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_envelope(n: u32, critical: bool) -> Envelope {
        Envelope {
            source: ActorId::from_index(0),
            critical,
            payload: Payload::Net {
                key: MessageKey::of::<u32>(),
                data: Arc::new(n),
            },
        }
    }

    fn payload_value(envelope: Envelope) -> u32 {
        match envelope.payload {
            Payload::Net { data, .. } => *data.downcast::<u32>().unwrap(),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn fifo_within_a_queue() {
        let mailbox = Mailbox::new();
        mailbox.push(net_envelope(1, false));
        mailbox.push(net_envelope(2, false));

        assert_eq!(payload_value(mailbox.pop().unwrap()), 1);
        assert_eq!(payload_value(mailbox.pop().unwrap()), 2);
        assert!(mailbox.pop().is_none());
    }

    #[test]
    fn critical_overtakes_normal() {
        let mailbox = Mailbox::new();
        mailbox.push(net_envelope(1, false));
        mailbox.push(net_envelope(2, true));

        assert!(mailbox.has_critical());
        assert_eq!(payload_value(mailbox.pop().unwrap()), 2);
        assert_eq!(payload_value(mailbox.pop().unwrap()), 1);
    }
}
