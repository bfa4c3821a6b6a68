//! Point-to-point and fan-out message delivery (the "net" channel).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use actor_graph::{ActorId, MessageKey};
use tracing::{debug, error, warn};

use crate::envelope::{Envelope, Fabric, Payload};
use crate::timer::TimerQueue;

/// What a net handler receives: the sender and shared access to the
/// payload. The payload `Arc` is the same one every fan-out receiver
/// sees.
pub struct NetContext<M> {
    source: ActorId,
    data: Arc<M>,
}

impl<M> NetContext<M> {
    pub fn source(&self) -> ActorId {
        self.source
    }

    pub fn data(&self) -> &M {
        &self.data
    }

    /// The shared payload itself, for handlers that keep it.
    pub fn shared(&self) -> Arc<M> {
        Arc::clone(&self.data)
    }
}

impl<M> Deref for NetContext<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.data
    }
}

type Handler<S> = Box<dyn FnMut(&mut S, ActorId, Arc<dyn Any + Send + Sync>) + Send>;

/// Per-actor registration table for net messages: message type → handler.
/// Built once during actor setup, consulted on every dispatch.
pub(crate) struct NetDispatch<S> {
    actor: ActorId,
    handlers: HashMap<TypeId, Handler<S>>,
}

impl<S> NetDispatch<S> {
    pub(crate) fn new(actor: ActorId) -> Self {
        Self {
            actor,
            handlers: HashMap::new(),
        }
    }

    pub(crate) fn register<M: Send + Sync + 'static>(
        &mut self,
        mut handler: impl FnMut(&mut S, NetContext<M>) + Send + 'static,
    ) {
        let erased: Handler<S> = Box::new(move |state, source, any| match any.downcast::<M>() {
            Ok(data) => handler(state, NetContext { source, data }),
            Err(_) => error!(
                message = %MessageKey::of::<M>(),
                "net payload failed to downcast to its registered type"
            ),
        });
        if self.handlers.insert(TypeId::of::<M>(), erased).is_some() {
            warn!(
                actor = %self.actor,
                message = %MessageKey::of::<M>(),
                "replacing an existing net handler"
            );
        }
    }

    /// Dispatches by the payload's runtime type. An unregistered type is
    /// logged and discarded; a panicking handler is contained and logged.
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
                    error!(
                        actor = %self.actor,
                        message = %key,
                        from = %source,
                        "error while processing message; handler panicked"
                    );
                }
            }
            None => error!(
                actor = %self.actor,
                message = %key,
                from = %source,
                "no handler registered; discarding message"
            ),
        }
    }
}

/// A bound output port: the receivers were resolved from the graph links
/// at setup time, in link-registration order. The actor sends without
/// knowing who is on the other side.
pub struct NetOutput<M> {
    source: ActorId,
    receivers: Arc<[ActorId]>,
    fabric: Arc<Fabric>,
    _marker: PhantomData<fn(M)>,
}

impl<M> Clone for NetOutput<M> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            receivers: Arc::clone(&self.receivers),
            fabric: Arc::clone(&self.fabric),
            _marker: PhantomData,
        }
    }
}

impl<M: Send + Sync + 'static> NetOutput<M> {
    pub(crate) fn new(source: ActorId, receivers: Vec<ActorId>, fabric: Arc<Fabric>) -> Self {
        Self {
            source,
            receivers: receivers.into(),
            fabric,
            _marker: PhantomData,
        }
    }

    /// Delivers to every linked input port, in link-registration order.
    /// With multiplicity `ExactlyOne` this is plain point-to-point.
    pub fn send(&self, data: M) {
        self.deliver(data, false);
    }

    /// Bypasses queued normal messages on every receiver. Only for
    /// signals whose late delivery would be worse than reordering.
    pub fn send_critical(&self, data: M) {
        self.deliver(data, true);
    }

    /// Sends after `delay`, on the owning actor's context.
    pub fn send_delayed(&self, timer: &TimerQueue, delay: Duration, data: M) {
        let output = self.clone();
        timer.delay(delay, move || output.send(data));
    }

    pub fn is_linked(&self) -> bool {
        !self.receivers.is_empty()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    fn deliver(&self, data: M, critical: bool) {
        if self.receivers.is_empty() {
            debug!(
                source = %self.source,
                message = %MessageKey::of::<M>(),
                "send on unlinked output dropped"
            );
            return;
        }
        let key = MessageKey::of::<M>();
        let data: Arc<dyn Any + Send + Sync> = Arc::new(data);
        for receiver in self.receivers.iter() {
            self.fabric.deliver(
                *receiver,
                Envelope {
                    source: self.source,
                    critical,
                    payload: Payload::Net {
                        key,
                        data: Arc::clone(&data),
                    },
                },
            );
        }
    }
}
