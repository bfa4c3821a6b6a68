//! Dynamic pub/sub (the event channel).
//!
//! Event wiring is not part of the static graph: actors subscribe and
//! unsubscribe by message type at runtime. A built-in relay actor owns
//! the subscription table and forwards each published event to the
//! subscribers registered for its runtime type, in subscription order.
//! Publishers do not know their audience; an event nobody subscribed to
//! is silently dropped.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use actor_graph::{ActorId, MessageKey};
use tracing::{debug, error, warn};

use crate::envelope::{Envelope, Fabric, Mailbox, Payload};
use crate::scheduler::{enough_time, Runnable, TickResult};

/// What an event handler receives: the publisher and shared payload.
pub struct EventContext<M> {
    source: ActorId,
    data: Arc<M>,
}

impl<M> EventContext<M> {
    pub fn source(&self) -> ActorId {
        self.source
    }

    pub fn data(&self) -> &M {
        &self.data
    }

    pub fn shared(&self) -> Arc<M> {
        Arc::clone(&self.data)
    }
}

impl<M> Deref for EventContext<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.data
    }
}

type EventHandler<S> = Box<dyn FnMut(&mut S, ActorId, Arc<dyn Any + Send + Sync>) + Send>;

/// Per-actor event subscriptions: local handler table plus the control
/// messages that keep the relay's table in sync.
pub(crate) struct EventDispatch<S> {
    actor: ActorId,
    relay: ActorId,
    fabric: Arc<Fabric>,
    handlers: HashMap<TypeId, EventHandler<S>>,
    subscribed: Vec<MessageKey>,
}

impl<S> EventDispatch<S> {
    pub(crate) fn new(actor: ActorId, relay: ActorId, fabric: Arc<Fabric>) -> Self {
        Self {
            actor,
            relay,
            fabric,
            handlers: HashMap::new(),
            subscribed: Vec::new(),
        }
    }

    pub(crate) fn relay(&self) -> ActorId {
        self.relay
    }

    pub(crate) fn subscribe<M: Send + Sync + 'static>(
        &mut self,
        mut handler: impl FnMut(&mut S, EventContext<M>) + Send + 'static,
    ) {
        let key = MessageKey::of::<M>();
        let erased: EventHandler<S> = Box::new(move |state, source, any| {
            match any.downcast::<M>() {
                Ok(data) => handler(state, EventContext { source, data }),
                Err(_) => error!(
                    message = %MessageKey::of::<M>(),
                    "event payload failed to downcast to its registered type"
                ),
            }
        });
        if self.handlers.insert(key.type_id(), erased).is_some() {
            warn!(actor = %self.actor, message = %key, "replacing an existing event handler");
        } else {
            self.subscribed.push(key);
        }
        self.fabric.deliver(
            self.relay,
            Envelope {
                source: self.actor,
                critical: false,
                payload: Payload::Subscribe {
                    subscriber: self.actor,
                    message: key,
                },
            },
        );
    }

    pub(crate) fn unsubscribe<M: Send + Sync + 'static>(&mut self) {
        let key = MessageKey::of::<M>();
        self.handlers.remove(&key.type_id());
        self.subscribed.retain(|k| *k != key);
        self.fabric.deliver(
            self.relay,
            Envelope {
                source: self.actor,
                critical: false,
                payload: Payload::Unsubscribe {
                    subscriber: self.actor,
                    message: key,
                },
            },
        );
    }

    /// Drops every subscription. Called on actor stop so the relay does
    /// not keep forwarding into a dead mailbox.
    pub(crate) fn unsubscribe_all(&mut self) {
        for key in self.subscribed.drain(..) {
            self.fabric.deliver(
                self.relay,
                Envelope {
                    source: self.actor,
                    critical: false,
                    payload: Payload::Unsubscribe {
                        subscriber: self.actor,
                        message: key,
                    },
                },
            );
        }
        self.handlers.clear();
    }

    pub(crate) fn dispatch(
        &mut self,
        state: &mut S,
        source: ActorId,
        key: MessageKey,
        data: Arc<dyn Any + Send + Sync>,
    ) {
        match self.handlers.get_mut(&key.type_id()) {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(state, source, data))).is_err() {
                    error!(actor = %self.actor, message = %key, "event handler panicked");
                }
            }
            // Not an error: may be an unsubscribe the relay has not
            // processed yet.
            None => debug!(actor = %self.actor, message = %key, "event with no local handler"),
        }
    }
}

/// Broadcast handle. Unlike net outputs there is no link resolution —
/// everything routes through the relay's subscription table.
pub struct EventOutput<M> {
    actor: ActorId,
    relay: ActorId,
    fabric: Arc<Fabric>,
    _marker: PhantomData<fn(M)>,
}

impl<M> Clone for EventOutput<M> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor,
            relay: self.relay,
            fabric: Arc::clone(&self.fabric),
            _marker: PhantomData,
        }
    }
}

impl<M: Send + Sync + 'static> EventOutput<M> {
    pub(crate) fn new(actor: ActorId, relay: ActorId, fabric: Arc<Fabric>) -> Self {
        Self {
            actor,
            relay,
            fabric,
            _marker: PhantomData,
        }
    }

    pub fn broadcast(&self, data: M) {
        self.fabric.deliver(
            self.relay,
            Envelope {
                source: self.actor,
                critical: false,
                payload: Payload::Event {
                    key: MessageKey::of::<M>(),
                    data: Arc::new(data),
                },
            },
        );
    }
}

struct Subscription {
    key: MessageKey,
    subscribers: Vec<ActorId>,
}

/// The built-in relay actor owning the subscription table.
pub(crate) struct RelayCell {
    id: ActorId,
    mailbox: Arc<Mailbox>,
    fabric: Arc<Fabric>,
    receivers: HashMap<TypeId, Subscription>,
}

impl RelayCell {
    pub(crate) fn new(id: ActorId, mailbox: Arc<Mailbox>, fabric: Arc<Fabric>) -> Self {
        Self {
            id,
            mailbox,
            fabric,
            receivers: HashMap::new(),
        }
    }

    fn process(&mut self, envelope: Envelope) {
        match envelope.payload {
            Payload::Subscribe { subscriber, message } => {
                let entry = self
                    .receivers
                    .entry(message.type_id())
                    .or_insert_with(|| Subscription {
                        key: message,
                        subscribers: Vec::new(),
                    });
                if entry.subscribers.contains(&subscriber) {
                    warn!(actor = %subscriber, message = %message, "already subscribed");
                    return;
                }
                entry.subscribers.push(subscriber);
            }
            Payload::Unsubscribe { subscriber, message } => {
                let removed = self
                    .receivers
                    .get_mut(&message.type_id())
                    .map(|entry| {
                        let before = entry.subscribers.len();
                        entry.subscribers.retain(|s| *s != subscriber);
                        entry.subscribers.len() != before
                    })
                    .unwrap_or(false);
                if !removed {
                    warn!(actor = %subscriber, message = %message, "no subscription");
                }
            }
            Payload::Event { key, data } => {
                let Some(entry) = self.receivers.get(&key.type_id()) else {
                    // Publishers do not know their audience.
                    return;
                };
                for subscriber in &entry.subscribers {
                    self.fabric.deliver(
                        *subscriber,
                        Envelope {
                            source: envelope.source,
                            critical: envelope.critical,
                            payload: Payload::Event {
                                key: entry.key,
                                data: Arc::clone(&data),
                            },
                        },
                    );
                }
            }
            other => warn!(relay = %self.id, payload = ?other, "unexpected payload at the event relay"),
        }
    }
}

impl Runnable for RelayCell {
    fn initialize(&mut self) {}

    fn start(&mut self) {}

    fn tick(&mut self, deadline: Instant) -> TickResult {
        loop {
            if !enough_time(deadline) && !self.mailbox.has_critical() {
                return if self.mailbox.is_empty() {
                    TickResult::Wait
                } else {
                    TickResult::Yield
                };
            }
            let Some(envelope) = self.mailbox.pop() else {
                return TickResult::Wait;
            };
            self.process(envelope);
        }
    }

    fn stop(&mut self) {}

    fn shutdown(&mut self) {
        self.receivers.clear();
    }

    fn state_any(&mut self) -> &mut dyn Any {
        self
    }
}
