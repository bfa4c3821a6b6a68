//! Correlated request/response (RPC) built atop the message fabric.
//!
//! Caller side: [`RpcOutput::call`] allocates a correlation token,
//! records a pending call, and sends the request to the single linked
//! input port. The returned [`PendingCall`] accepts exactly one success
//! and one failure continuation; the record commits when the handle
//! drops and resolves at most once — the resolver is physically removed
//! from the table before it runs.
//!
//! Responder side: the registered handler receives an [`RpcContext`]
//! that must be answered with [`reply`](RpcContext::reply) or
//! [`fail`](RpcContext::fail). The context is storable, which is what
//! makes request coalescing possible: hold N contexts for equivalent
//! requests, issue one downstream call, and fan the result out. A
//! context dropped without an answer — handler panic, forgotten reply,
//! actor teardown — synthesizes a failure so no caller is left pending.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use actor_graph::{ActorId, MessageKey};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::envelope::{CallId, Envelope, Fabric, Payload};
use crate::error::ChannelError;

/// Resolves one pending call with its outcome. Invoked with the owning
/// actor's state, outside the table lock.
pub(crate) type Resolver =
    Box<dyn FnOnce(&mut dyn Any, Result<Box<dyn Any + Send>, ChannelError>) + Send>;

/// Pending-call bookkeeping for one actor and one channel (rpc and pipe
/// each keep their own). Owned behind a mutex so bound outputs stored in
/// the actor's state can allocate ids; the lock is only ever held for a
/// map operation.
#[derive(Default)]
pub(crate) struct CallTable {
    next_id: u64,
    pending: HashMap<CallId, Resolver>,
}

impl CallTable {
    pub(crate) fn allocate(&mut self) -> CallId {
        self.next_id += 1;
        CallId(self.next_id)
    }

    pub(crate) fn commit(&mut self, id: CallId, resolver: Resolver) {
        debug_assert!(!self.pending.contains_key(&id), "call record committed twice");
        self.pending.insert(id, resolver);
    }

    pub(crate) fn take(&mut self, id: CallId) -> Option<Resolver> {
        self.pending.remove(&id)
    }

    pub(crate) fn drain(&mut self) -> Vec<Resolver> {
        self.pending.drain().map(|(_, resolver)| resolver).collect()
    }
}

/// Runs the continuation for `call`, exactly once. A reply for an
/// unknown or already resolved token is logged and dropped.
pub(crate) fn resolve_pending(
    table: &Arc<Mutex<CallTable>>,
    state: &mut dyn Any,
    actor: ActorId,
    call: CallId,
    outcome: Result<Box<dyn Any + Send>, ChannelError>,
) {
    let resolver = table.lock().take(call);
    match resolver {
        Some(resolver) => resolver(state, outcome),
        None => warn!(
            actor = %actor,
            call = %call,
            "reply for unknown or already resolved call discarded"
        ),
    }
}

/// Fails every pending record with `error`. Used on cancellation and
/// teardown so no continuation is leaked.
pub(crate) fn fail_all_pending(
    table: &Arc<Mutex<CallTable>>,
    state: &mut dyn Any,
    error: &ChannelError,
) {
    let resolvers = table.lock().drain();
    for resolver in resolvers {
        resolver(&mut *state, Err(error.clone()));
    }
}

/// Handle returned by [`RpcOutput::call`]. Register the continuations,
/// then let it drop — that commits the call record.
pub struct PendingCall<S: 'static, C: Send + 'static, U: Send + 'static, R: Send + 'static> {
    table: Arc<Mutex<CallTable>>,
    id: CallId,
    context: Option<C>,
    user: Option<U>,
    on_success: Option<Box<dyn FnOnce(&mut S, C, U, R) + Send>>,
    on_failure: Option<Box<dyn FnOnce(&mut S, C, U, ChannelError) + Send>>,
}

impl<S: 'static, C: Send + 'static, U: Send + 'static, R: Send + 'static> PendingCall<S, C, U, R> {
    pub(crate) fn new(table: Arc<Mutex<CallTable>>, id: CallId, context: C, user: U) -> Self {
        Self {
            table,
            id,
            context: Some(context),
            user: Some(user),
            on_success: None,
            on_failure: None,
        }
    }

    /// The success continuation. At most one.
    pub fn on_success(mut self, f: impl FnOnce(&mut S, C, U, R) + Send + 'static) -> Self {
        debug_assert!(self.on_success.is_none(), "success continuation registered twice");
        self.on_success = Some(Box::new(f));
        self
    }

    /// The failure continuation. At most one. Cancellation arrives here
    /// as [`ChannelError::Cancelled`]; check it before logging.
    pub fn on_failure(mut self, f: impl FnOnce(&mut S, C, U, ChannelError) + Send + 'static) -> Self {
        debug_assert!(self.on_failure.is_none(), "failure continuation registered twice");
        self.on_failure = Some(Box::new(f));
        self
    }
}

impl<S: 'static, C: Send + 'static, U: Send + 'static, R: Send + 'static> Drop
    for PendingCall<S, C, U, R>
{
    fn drop(&mut self) {
        let (Some(context), Some(user)) = (self.context.take(), self.user.take()) else {
            return;
        };
        let on_success = self.on_success.take();
        let on_failure = self.on_failure.take();

        let resolver: Resolver = Box::new(move |state_any, outcome| {
            let Some(state) = state_any.downcast_mut::<S>() else {
                error!(
                    expected = type_name::<S>(),
                    "rpc continuation bound to a different state type; dropping result"
                );
                return;
            };
            match outcome {
                Ok(data) => match data.downcast::<R>() {
                    Ok(result) => {
                        if let Some(f) = on_success {
                            f(state, context, user, *result);
                        }
                    }
                    Err(_) => {
                        let err = ChannelError::failed(format!(
                            "reply type does not match expected {}",
                            type_name::<R>()
                        ));
                        match on_failure {
                            Some(f) => f(state, context, user, err),
                            None => error!(error = %err, "rpc reply discarded"),
                        }
                    }
                },
                Err(error) => match on_failure {
                    Some(f) => f(state, context, user, error),
                    None => {
                        if !error.is_cancelled() {
                            warn!(error = %error, "rpc failed with no failure continuation");
                        }
                    }
                },
            }
        });
        self.table.lock().commit(self.id, resolver);
    }
}

/// Responder-side view of one request. Must be answered exactly once.
pub struct RpcContext<M, R> {
    caller: ActorId,
    responder: ActorId,
    call: CallId,
    fabric: Arc<Fabric>,
    data: M,
    replied: bool,
    _marker: PhantomData<fn(R)>,
}

impl<M, R: Send + 'static> RpcContext<M, R> {
    pub fn caller(&self) -> ActorId {
        self.caller
    }

    pub fn data(&self) -> &M {
        &self.data
    }

    pub fn reply(mut self, result: R) {
        self.replied = true;
        self.fabric.deliver(
            self.caller,
            Envelope {
                source: self.responder,
                critical: false,
                payload: Payload::RpcSuccess {
                    call: self.call,
                    data: Box::new(result),
                },
            },
        );
    }

    pub fn fail(mut self, error: ChannelError) {
        self.replied = true;
        self.fabric.deliver(
            self.caller,
            Envelope {
                source: self.responder,
                critical: false,
                payload: Payload::RpcFailure {
                    call: self.call,
                    error,
                },
            },
        );
    }
}

impl<M, R> Drop for RpcContext<M, R> {
    fn drop(&mut self) {
        if self.replied {
            return;
        }
        warn!(
            responder = %self.responder,
            caller = %self.caller,
            call = %self.call,
            "rpc request dropped without a reply; synthesizing failure"
        );
        self.fabric.deliver(
            self.caller,
            Envelope {
                source: self.responder,
                critical: false,
                payload: Payload::RpcFailure {
                    call: self.call,
                    error: ChannelError::failed("request dropped without a reply"),
                },
            },
        );
    }
}

type RpcHandler<S> = Box<dyn FnMut(&mut S, ActorId, CallId, Box<dyn Any + Send>) + Send>;

/// Per-actor registration table for rpc endpoints: request type → handler.
pub(crate) struct RpcDispatch<S> {
    actor: ActorId,
    fabric: Arc<Fabric>,
    handlers: HashMap<TypeId, RpcHandler<S>>,
}

impl<S> RpcDispatch<S> {
    pub(crate) fn new(actor: ActorId, fabric: Arc<Fabric>) -> Self {
        Self {
            actor,
            fabric,
            handlers: HashMap::new(),
        }
    }

    pub(crate) fn register<M: Send + 'static, R: Send + 'static>(
        &mut self,
        mut handler: impl FnMut(&mut S, RpcContext<M, R>) + Send + 'static,
    ) {
        let responder = self.actor;
        let fabric = Arc::clone(&self.fabric);
        let erased: RpcHandler<S> = Box::new(move |state, caller, call, data| {
            match data.downcast::<M>() {
                Ok(data) => handler(
                    state,
                    RpcContext {
                        caller,
                        responder,
                        call,
                        fabric: Arc::clone(&fabric),
                        data: *data,
                        replied: false,
                        _marker: PhantomData,
                    },
                ),
                Err(_) => error!(
                    message = %MessageKey::of::<M>(),
                    "rpc payload failed to downcast to its registered type"
                ),
            }
        });
        if self.handlers.insert(TypeId::of::<M>(), erased).is_some() {
            warn!(
                actor = %self.actor,
                message = %MessageKey::of::<M>(),
                "replacing an existing rpc handler"
            );
        }
    }

    /// Dispatches one request. A missing endpoint or a panicking handler
    /// both produce a failure reply to the caller — the channel never
    /// leaves a call record pending (a panicked handler's context sends
    /// its failure from its drop).
    pub(crate) fn dispatch(
        &mut self,
        state: &mut S,
        source: ActorId,
        key: MessageKey,
        call: CallId,
        data: Box<dyn Any + Send>,
    ) {
        match self.handlers.get_mut(&key.type_id()) {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(state, source, call, data))).is_err() {
                    error!(
                        actor = %self.actor,
                        message = %key,
                        from = %source,
                        "rpc handler panicked"
                    );
                }
            }
            None => {
                warn!(
                    actor = %self.actor,
                    message = %key,
                    from = %source,
                    "rpc endpoint does not exist"
                );
                self.fabric.deliver(
                    source,
                    Envelope {
                        source: self.actor,
                        critical: false,
                        payload: Payload::RpcFailure {
                            call,
                            error: ChannelError::NoEndpoint {
                                message: key.name().to_string(),
                                actor: self.actor.to_string(),
                            },
                        },
                    },
                );
            }
        }
    }
}

/// A bound rpc output port: multiplicity `ExactlyOne`, so the target is
/// the single linked input (or none, for an optional unlinked port).
pub struct RpcOutput<M, R = ()> {
    caller: ActorId,
    target: Option<ActorId>,
    fabric: Arc<Fabric>,
    table: Arc<Mutex<CallTable>>,
    _marker: PhantomData<fn(M, R)>,
}

impl<M, R> Clone for RpcOutput<M, R> {
    fn clone(&self) -> Self {
        Self {
            caller: self.caller,
            target: self.target,
            fabric: Arc::clone(&self.fabric),
            table: Arc::clone(&self.table),
            _marker: PhantomData,
        }
    }
}

impl<M: Send + 'static, R: Send + 'static> RpcOutput<M, R> {
    pub(crate) fn new(
        caller: ActorId,
        target: Option<ActorId>,
        fabric: Arc<Fabric>,
        table: Arc<Mutex<CallTable>>,
    ) -> Self {
        Self {
            caller,
            target,
            fabric,
            table,
            _marker: PhantomData,
        }
    }

    /// Issues one request. `context` and `user` are handed back, by
    /// value, to whichever continuation fires.
    ///
    /// Calling through an unlinked (optional) output fails the call with
    /// [`ChannelError::NoEndpoint`] instead of sending anything.
    pub fn call<S: 'static, C: Send + 'static, U: Send + 'static>(
        &self,
        context: C,
        user: U,
        data: M,
    ) -> PendingCall<S, C, U, R> {
        self.start_call(context, user, data, false)
    }

    /// Like [`call`](Self::call), but the request bypasses queued normal
    /// messages on the responder.
    pub fn call_critical<S: 'static, C: Send + 'static, U: Send + 'static>(
        &self,
        context: C,
        user: U,
        data: M,
    ) -> PendingCall<S, C, U, R> {
        self.start_call(context, user, data, true)
    }

    pub fn is_linked(&self) -> bool {
        self.target.is_some()
    }

    fn start_call<S: 'static, C: Send + 'static, U: Send + 'static>(
        &self,
        context: C,
        user: U,
        data: M,
        critical: bool,
    ) -> PendingCall<S, C, U, R> {
        let id = self.table.lock().allocate();
        match self.target {
            Some(target) => self.fabric.deliver(
                target,
                Envelope {
                    source: self.caller,
                    critical,
                    payload: Payload::RpcRequest {
                        key: MessageKey::of::<M>(),
                        call: id,
                        data: Box::new(data),
                    },
                },
            ),
            None => {
                debug!(
                    caller = %self.caller,
                    message = %MessageKey::of::<M>(),
                    "call on unlinked rpc output; failing immediately"
                );
                self.fabric.deliver(
                    self.caller,
                    Envelope {
                        source: self.caller,
                        critical: false,
                        payload: Payload::RpcFailure {
                            call: id,
                            error: ChannelError::NoEndpoint {
                                message: MessageKey::of::<M>().name().to_string(),
                                actor: self.caller.to_string(),
                            },
                        },
                    },
                );
            }
        }
        PendingCall::new(Arc::clone(&self.table), id, context, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique() {
        let mut table = CallTable::default();
        let first = table.allocate();
        let second = table.allocate();
        assert_ne!(first, second);
    }

    #[test]
    fn a_record_resolves_at_most_once() {
        let mut table = CallTable::default();
        let id = table.allocate();
        table.commit(id, Box::new(|_, _| {}));

        assert!(table.take(id).is_some());
        assert!(table.take(id).is_none());
    }
}
