//! Ordered interception chains (the pipe channel).
//!
//! A pipe carries structural lifecycle messages through every registered
//! interceptor in graph order. Each stage receives a [`PipeContext`] and
//! must either [`continue_chain`](PipeContext::continue_chain) to the
//! next stage or [`fail`](PipeContext::fail) back to the origin; when the
//! frame returns to the origin the chain's success or failure
//! continuation fires. A stage that holds its context forever stalls the
//! chain — the channel provides no timeout; that is each handler's
//! correctness obligation. A context *dropped* without continuing (panic
//! included) short-circuits deterministically with a synthesized
//! failure.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use actor_graph::{ActorId, MessageKey};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::envelope::{Envelope, Fabric, Payload, PipeFrame};
use crate::error::ChannelError;
use crate::rpc::{CallTable, PendingCall};

/// One stage's view of a travelling pipe frame.
pub struct PipeContext<M: Send + 'static> {
    key: MessageKey,
    call: crate::envelope::CallId,
    origin: ActorId,
    next: ActorId,
    stage: ActorId,
    fabric: Arc<Fabric>,
    data: Option<Box<M>>,
    forwarded: bool,
}

impl<M: Send + 'static> PipeContext<M> {
    pub fn data(&self) -> &M {
        self.data
            .as_deref()
            .expect("pipe payload is present until the context is consumed")
    }

    pub fn data_mut(&mut self) -> &mut M {
        self.data
            .as_deref_mut()
            .expect("pipe payload is present until the context is consumed")
    }

    /// The actor that pushed the chain.
    pub fn origin(&self) -> ActorId {
        self.origin
    }

    /// Advances the frame to the next registered interceptor (or back to
    /// the origin when this stage is the last).
    pub fn continue_chain(mut self) {
        self.forwarded = true;
        let data = self.take_data();
        self.fabric.deliver(
            self.next,
            Envelope {
                source: self.stage,
                critical: false,
                payload: Payload::Pipe(PipeFrame {
                    key: self.key,
                    call: self.call,
                    origin: self.origin,
                    error: None,
                    data,
                }),
            },
        );
    }

    /// Short-circuits the remaining stages: the frame returns to the
    /// origin carrying `error` and the chain's failure continuation
    /// fires.
    pub fn fail(mut self, error: ChannelError) {
        self.forwarded = true;
        let data = self.take_data();
        self.fabric.deliver(
            self.origin,
            Envelope {
                source: self.stage,
                critical: false,
                payload: Payload::Pipe(PipeFrame {
                    key: self.key,
                    call: self.call,
                    origin: self.origin,
                    error: Some(error),
                    data,
                }),
            },
        );
    }

    fn take_data(&mut self) -> Box<dyn std::any::Any + Send> {
        match self.data.take() {
            Some(data) => data,
            None => Box::new(()),
        }
    }
}

impl<M: Send + 'static> Drop for PipeContext<M> {
    fn drop(&mut self) {
        if self.forwarded {
            return;
        }
        warn!(
            stage = %self.stage,
            origin = %self.origin,
            message = %self.key,
            "pipe stage dropped without continuing; failing the chain"
        );
        let data = self.take_data();
        self.fabric.deliver(
            self.origin,
            Envelope {
                source: self.stage,
                critical: false,
                payload: Payload::Pipe(PipeFrame {
                    key: self.key,
                    call: self.call,
                    origin: self.origin,
                    error: Some(ChannelError::failed("pipe stage dropped without continuing")),
                    data,
                }),
            },
        );
    }
}

type PipeHandler<S> = Box<dyn FnMut(&mut S, PipeFrame, ActorId) + Send>;

struct PipeEntry<S> {
    /// Next stage in chain order, resolved from this actor's pipe output
    /// port at setup time. `None` means the frame returns to its origin.
    next: Option<ActorId>,
    handler: PipeHandler<S>,
}

/// Per-actor registration table for pipe stages.
pub(crate) struct PipeDispatch<S> {
    actor: ActorId,
    fabric: Arc<Fabric>,
    handlers: HashMap<TypeId, PipeEntry<S>>,
}

impl<S> PipeDispatch<S> {
    pub(crate) fn new(actor: ActorId, fabric: Arc<Fabric>) -> Self {
        Self {
            actor,
            fabric,
            handlers: HashMap::new(),
        }
    }

    pub(crate) fn register<M: Send + 'static>(
        &mut self,
        next: Option<ActorId>,
        mut handler: impl FnMut(&mut S, PipeContext<M>) + Send + 'static,
    ) {
        let stage = self.actor;
        let fabric = Arc::clone(&self.fabric);
        let erased: PipeHandler<S> = Box::new(move |state, frame, next_hop| {
            match frame.data.downcast::<M>() {
                Ok(data) => handler(
                    state,
                    PipeContext {
                        key: frame.key,
                        call: frame.call,
                        origin: frame.origin,
                        next: next_hop,
                        stage,
                        fabric: Arc::clone(&fabric),
                        data: Some(data),
                        forwarded: false,
                    },
                ),
                Err(_) => error!(
                    message = %MessageKey::of::<M>(),
                    "pipe payload failed to downcast to its registered type"
                ),
            }
        });
        if self
            .handlers
            .insert(MessageKey::of::<M>().type_id(), PipeEntry { next, handler: erased })
            .is_some()
        {
            warn!(
                actor = %self.actor,
                message = %MessageKey::of::<M>(),
                "replacing an existing pipe handler"
            );
        }
    }

    /// Runs the registered stage for a frame that has not yet returned to
    /// its origin. A missing stage or a panicking handler fails the
    /// chain back to the origin.
    pub(crate) fn dispatch(&mut self, state: &mut S, frame: PipeFrame) {
        let key = frame.key;
        match self.handlers.get_mut(&key.type_id()) {
            Some(entry) => {
                let next = entry.next.unwrap_or(frame.origin);
                let handler = &mut entry.handler;
                if catch_unwind(AssertUnwindSafe(|| handler(state, frame, next))).is_err() {
                    // The context's drop already failed the chain.
                    error!(actor = %self.actor, message = %key, "pipe handler panicked");
                }
            }
            None => {
                warn!(actor = %self.actor, message = %key, "pipe stage does not exist");
                let origin = frame.origin;
                self.fabric.deliver(
                    origin,
                    Envelope {
                        source: self.actor,
                        critical: false,
                        payload: Payload::Pipe(PipeFrame {
                            error: Some(ChannelError::NoEndpoint {
                                message: key.name().to_string(),
                                actor: self.actor.to_string(),
                            }),
                            ..frame
                        }),
                    },
                );
            }
        }
    }
}

/// Starts interception chains. The first stage is the single linked pipe
/// input (`ZeroOrOne`); with no link the frame bounces straight back and
/// the success continuation receives the payload unchanged.
pub struct PipeOutput<M> {
    origin: ActorId,
    first: Option<ActorId>,
    fabric: Arc<Fabric>,
    table: Arc<Mutex<CallTable>>,
    _marker: PhantomData<fn(M)>,
}

impl<M> Clone for PipeOutput<M> {
    fn clone(&self) -> Self {
        Self {
            origin: self.origin,
            first: self.first,
            fabric: Arc::clone(&self.fabric),
            table: Arc::clone(&self.table),
            _marker: PhantomData,
        }
    }
}

impl<M: Send + 'static> PipeOutput<M> {
    pub(crate) fn new(
        origin: ActorId,
        first: Option<ActorId>,
        fabric: Arc<Fabric>,
        table: Arc<Mutex<CallTable>>,
    ) -> Self {
        Self {
            origin,
            first,
            fabric,
            table,
            _marker: PhantomData,
        }
    }

    /// Pushes `data` through the chain. The success continuation fires
    /// with the payload once every stage has continued; the failure
    /// continuation fires if any stage fails or drops out.
    pub fn push<S: 'static, C: Send + 'static, U: Send + 'static>(
        &self,
        context: C,
        user: U,
        data: M,
    ) -> PendingCall<S, C, U, M> {
        self.start_push(context, user, data, false)
    }

    pub fn push_critical<S: 'static, C: Send + 'static, U: Send + 'static>(
        &self,
        context: C,
        user: U,
        data: M,
    ) -> PendingCall<S, C, U, M> {
        self.start_push(context, user, data, true)
    }

    fn start_push<S: 'static, C: Send + 'static, U: Send + 'static>(
        &self,
        context: C,
        user: U,
        data: M,
        critical: bool,
    ) -> PendingCall<S, C, U, M> {
        let id = self.table.lock().allocate();
        let destination = self.first.unwrap_or(self.origin);
        self.fabric.deliver(
            destination,
            Envelope {
                source: self.origin,
                critical,
                payload: Payload::Pipe(PipeFrame {
                    key: MessageKey::of::<M>(),
                    call: id,
                    origin: self.origin,
                    error: None,
                    data: Box::new(data),
                }),
            },
        );
        PendingCall::new(Arc::clone(&self.table), id, context, user)
    }
}
