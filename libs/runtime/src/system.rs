//! Actor system assembly: the lifecycle trait, per-actor cells, the
//! explicit setup/registration surface, and the system builder.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use actor_graph::{components, ActorId, ActorKindId, GraphInstance, MessageKey, PortDirection};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{spawn_driver, AsyncSource};
use crate::dispatch::{DispatcherCell, DispatcherCore, MainThreadHandle};
use crate::envelope::{Envelope, Fabric, Mailbox, Payload};
use crate::error::{ChannelError, SystemError};
use crate::event::{EventContext, EventDispatch, EventOutput, RelayCell};
use crate::jobs::{JobPool, DEFAULT_RETRY_BUDGET};
use crate::net::{NetContext, NetDispatch, NetOutput};
use crate::pipe::{PipeContext, PipeDispatch, PipeOutput};
use crate::rpc::{self, CallTable, RpcContext, RpcDispatch, RpcOutput};
use crate::scheduler::{enough_time, Runnable, Scheduler, TickResult};
use crate::timer::TimerQueue;

/// Lifecycle hooks of an actor's state object.
///
/// `initialize` runs once at construction time (inject dependencies,
/// open resources); `start` begins active participation; `tick` runs
/// whenever the actor is scheduled and should return [`TickResult::Wait`]
/// once no further progress is possible without external input;
/// `stop` and `shutdown` release resources in reverse order of
/// acquisition. All hooks and every registered handler run on the
/// execution context that owns the actor.
pub trait Actor: Send + 'static {
    fn initialize(&mut self) {}

    fn start(&mut self) {}

    fn tick(&mut self, _deadline: Instant) -> TickResult {
        TickResult::Wait
    }

    fn stop(&mut self) {}

    fn shutdown(&mut self) {}
}

/// Raw per-instance ingredients handed to a factory wrapper.
struct SetupSeed<'a> {
    id: ActorId,
    graph: &'a GraphInstance,
    fabric: &'a Arc<Fabric>,
    token: &'a CancellationToken,
    runtime: &'a tokio::runtime::Handle,
    relay: ActorId,
    main: &'a MainThreadHandle,
}

/// The registration surface handed to an actor's factory.
///
/// This is where the explicit handler table is built: every input the
/// actor serves is registered here, and every output it sends through is
/// bound here, resolved against the graph. Nothing is discovered by
/// reflection at runtime.
pub struct SetupContext<'a, S: Actor> {
    id: ActorId,
    graph: &'a GraphInstance,
    fabric: Arc<Fabric>,
    token: CancellationToken,
    runtime: tokio::runtime::Handle,
    main: MainThreadHandle,
    net: NetDispatch<S>,
    rpc: RpcDispatch<S>,
    pipe: PipeDispatch<S>,
    events: EventDispatch<S>,
    rpc_calls: Arc<Mutex<CallTable>>,
    pipe_calls: Arc<Mutex<CallTable>>,
    jobs: Option<JobPool<S>>,
    timer: Option<TimerQueue>,
    sources: Vec<Arc<dyn AsyncSource>>,
}

impl<'a, S: Actor> SetupContext<'a, S> {
    fn from_seed(seed: SetupSeed<'a>) -> Self {
        let fabric = Arc::clone(seed.fabric);
        Self {
            id: seed.id,
            graph: seed.graph,
            net: NetDispatch::new(seed.id),
            rpc: RpcDispatch::new(seed.id, Arc::clone(&fabric)),
            pipe: PipeDispatch::new(seed.id, Arc::clone(&fabric)),
            events: EventDispatch::new(seed.id, seed.relay, Arc::clone(&fabric)),
            fabric,
            token: seed.token.clone(),
            runtime: seed.runtime.clone(),
            main: seed.main.clone(),
            rpc_calls: Arc::new(Mutex::new(CallTable::default())),
            pipe_calls: Arc::new(Mutex::new(CallTable::default())),
            jobs: None,
            timer: None,
            sources: Vec::new(),
        }
    }

    /// This actor instance's handle.
    pub fn handle(&self) -> ActorId {
        self.id
    }

    /// The ambient cancellation token scoped to the system's lifetime.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Handle for requesting main-thread execution.
    pub fn main_thread(&self) -> MainThreadHandle {
        self.main.clone()
    }

    /// Registers the handler for net messages of type `M`.
    pub fn net_input<M: Send + Sync + 'static>(
        &mut self,
        handler: impl FnMut(&mut S, NetContext<M>) + Send + 'static,
    ) {
        self.net.register(handler);
    }

    /// Registers the handler for rpc requests of type `M` replying `R`.
    pub fn rpc_input<M: Send + 'static, R: Send + 'static>(
        &mut self,
        handler: impl FnMut(&mut S, RpcContext<M, R>) + Send + 'static,
    ) {
        self.rpc.register(handler);
    }

    /// Registers this actor as a pipe stage for `M`. The next stage is
    /// resolved from this actor's pipe output port for the same type.
    pub fn pipe_input<M: Send + 'static>(
        &mut self,
        handler: impl FnMut(&mut S, PipeContext<M>) + Send + 'static,
    ) {
        let next = self
            .graph
            .find_port(self.id, PortDirection::Output, components::PIPE, MessageKey::of::<M>())
            .map(|port| self.graph.receivers(port))
            .and_then(|receivers| receivers.into_iter().next());
        self.pipe.register(next, handler);
    }

    /// Subscribes to events of type `M`.
    pub fn subscribe_event<M: Send + Sync + 'static>(
        &mut self,
        handler: impl FnMut(&mut S, EventContext<M>) + Send + 'static,
    ) {
        self.events.subscribe(handler);
    }

    /// Binds the net output port carrying `M`.
    pub fn net_output<M: Send + Sync + 'static>(&self) -> NetOutput<M> {
        let receivers = self.output_receivers(components::NET, MessageKey::of::<M>());
        NetOutput::new(self.id, receivers, Arc::clone(&self.fabric))
    }

    /// Binds the rpc output port carrying `M` and expecting `R` back.
    pub fn rpc_output<M: Send + 'static, R: Send + 'static>(&self) -> RpcOutput<M, R> {
        let target = self
            .output_receivers(components::RPC, MessageKey::of::<M>())
            .into_iter()
            .next();
        RpcOutput::new(
            self.id,
            target,
            Arc::clone(&self.fabric),
            Arc::clone(&self.rpc_calls),
        )
    }

    /// Binds the pipe output port carrying `M`.
    pub fn pipe_output<M: Send + 'static>(&self) -> PipeOutput<M> {
        let first = self
            .output_receivers(components::PIPE, MessageKey::of::<M>())
            .into_iter()
            .next();
        PipeOutput::new(
            self.id,
            first,
            Arc::clone(&self.fabric),
            Arc::clone(&self.pipe_calls),
        )
    }

    /// Handle for broadcasting events of type `M`.
    pub fn event_output<M: Send + Sync + 'static>(&self) -> EventOutput<M> {
        EventOutput::new(self.id, self.events_relay(), Arc::clone(&self.fabric))
    }

    /// This actor's background job pool, created on first use with the
    /// default concurrency and retry budget.
    pub fn jobs(&mut self) -> JobPool<S> {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.jobs_with(concurrency, DEFAULT_RETRY_BUDGET)
    }

    /// Like [`jobs`](Self::jobs), with explicit limits. The limits of an
    /// already-created pool are not changed.
    pub fn jobs_with(&mut self, concurrency: usize, retry_budget: u32) -> JobPool<S> {
        if let Some(jobs) = &self.jobs {
            return jobs.clone();
        }
        let jobs = JobPool::new(
            self.runtime.clone(),
            self.token.clone(),
            concurrency,
            retry_budget,
        );
        self.sources.push(Arc::new(jobs.clone()) as Arc<dyn AsyncSource>);
        self.jobs = Some(jobs.clone());
        jobs
    }

    /// This actor's timer queue, created on first use.
    pub fn timer(&mut self) -> TimerQueue {
        if let Some(timer) = &self.timer {
            return timer.clone();
        }
        let timer = TimerQueue::new(self.runtime.clone(), self.token.clone());
        self.sources.push(Arc::new(timer.clone()) as Arc<dyn AsyncSource>);
        self.timer = Some(timer.clone());
        timer
    }

    /// Registers a custom background source; the actor is woken whenever
    /// it signals.
    pub fn add_source(&mut self, source: Arc<dyn AsyncSource>) {
        self.sources.push(source);
    }

    fn events_relay(&self) -> ActorId {
        self.events.relay()
    }

    fn output_receivers(
        &self,
        component: actor_graph::ComponentKindId,
        message: MessageKey,
    ) -> Vec<ActorId> {
        match self
            .graph
            .find_port(self.id, PortDirection::Output, component, message)
        {
            Some(port) => self.graph.receivers(port),
            None => {
                warn!(
                    actor = %self.id,
                    message = %message,
                    "output port not declared on this actor kind"
                );
                Vec::new()
            }
        }
    }

    fn into_cell(self, state: S) -> (ActorCell<S>, Vec<Arc<dyn AsyncSource>>) {
        let mailbox = self.fabric.mailbox(self.id).unwrap_or_else(|| {
            warn!(actor = %self.id, "no mailbox in the fabric; creating a detached one");
            Arc::new(Mailbox::new())
        });
        let cell = ActorCell {
            id: self.id,
            state,
            mailbox,
            net: self.net,
            rpc: self.rpc,
            pipe: self.pipe,
            events: self.events,
            rpc_calls: self.rpc_calls,
            pipe_calls: self.pipe_calls,
            jobs: self.jobs,
            timer: self.timer,
            token: self.token,
            cancel_drained: false,
        };
        (cell, self.sources)
    }
}

/// One scheduled actor: its state plus the channel dispatch tables and
/// pending-call bookkeeping built during setup.
struct ActorCell<S: Actor> {
    id: ActorId,
    state: S,
    mailbox: Arc<Mailbox>,
    net: NetDispatch<S>,
    rpc: RpcDispatch<S>,
    pipe: PipeDispatch<S>,
    events: EventDispatch<S>,
    rpc_calls: Arc<Mutex<CallTable>>,
    pipe_calls: Arc<Mutex<CallTable>>,
    jobs: Option<JobPool<S>>,
    timer: Option<TimerQueue>,
    token: CancellationToken,
    cancel_drained: bool,
}

impl<S: Actor> ActorCell<S> {
    fn dispatch(&mut self, envelope: Envelope) {
        let source = envelope.source;
        match envelope.payload {
            Payload::Net { key, data } => self.net.dispatch(&mut self.state, source, key, data),
            Payload::Event { key, data } => {
                self.events.dispatch(&mut self.state, source, key, data)
            }
            Payload::RpcRequest { key, call, data } => {
                self.rpc.dispatch(&mut self.state, source, key, call, data)
            }
            Payload::RpcSuccess { call, data } => rpc::resolve_pending(
                &self.rpc_calls,
                &mut self.state as &mut dyn Any,
                self.id,
                call,
                Ok(data),
            ),
            Payload::RpcFailure { call, error } => rpc::resolve_pending(
                &self.rpc_calls,
                &mut self.state as &mut dyn Any,
                self.id,
                call,
                Err(error),
            ),
            Payload::Pipe(frame) => {
                if frame.origin == self.id {
                    let outcome = match frame.error {
                        Some(error) => Err(error),
                        None => Ok(frame.data),
                    };
                    rpc::resolve_pending(
                        &self.pipe_calls,
                        &mut self.state as &mut dyn Any,
                        self.id,
                        frame.call,
                        outcome,
                    );
                } else {
                    self.pipe.dispatch(&mut self.state, frame);
                }
            }
            Payload::Subscribe { .. } | Payload::Unsubscribe { .. } => warn!(
                actor = %self.id,
                "subscription control message delivered to a non-relay actor"
            ),
        }
    }

    /// Resolves every pending call record with cancellation. Runs once,
    /// on the actor's own context.
    fn fail_pending(&mut self) {
        let error = ChannelError::Cancelled;
        rpc::fail_all_pending(&self.rpc_calls, &mut self.state as &mut dyn Any, &error);
        rpc::fail_all_pending(&self.pipe_calls, &mut self.state as &mut dyn Any, &error);
    }
}

impl<S: Actor> Runnable for ActorCell<S> {
    fn initialize(&mut self) {
        self.state.initialize();
    }

    fn start(&mut self) {
        self.state.start();
    }

    fn tick(&mut self, deadline: Instant) -> TickResult {
        if self.token.is_cancelled() && !self.cancel_drained {
            self.cancel_drained = true;
            self.fail_pending();
        }

        let mut result = TickResult::Wait;

        // Drain the mailbox; critical messages ignore the deadline.
        loop {
            if !enough_time(deadline) && !self.mailbox.has_critical() {
                if !self.mailbox.is_empty() {
                    result = TickResult::Yield;
                }
                break;
            }
            let Some(envelope) = self.mailbox.pop() else {
                break;
            };
            self.dispatch(envelope);
        }

        if self.state.tick(deadline) == TickResult::Yield {
            result = TickResult::Yield;
        }
        if let Some(jobs) = &self.jobs {
            if jobs.drain(&mut self.state, deadline) == TickResult::Yield {
                result = TickResult::Yield;
            }
        }
        if let Some(timer) = &self.timer {
            timer.drain();
        }
        result
    }

    fn stop(&mut self) {
        if !self.cancel_drained {
            self.cancel_drained = true;
            self.fail_pending();
        }
        if let Some(jobs) = &self.jobs {
            jobs.fail_outstanding(&mut self.state);
        }
        self.events.unsubscribe_all();
        self.state.stop();
    }

    fn shutdown(&mut self) {
        self.state.shutdown();
    }

    fn state_any(&mut self) -> &mut dyn Any {
        &mut self.state
    }
}

type Factory =
    Box<dyn for<'a> FnMut(SetupSeed<'a>) -> (Box<dyn Runnable>, Vec<Arc<dyn AsyncSource>>)>;

/// Assembles an [`ActorSystem`] from a frozen graph and one factory per
/// actor kind.
pub struct SystemBuilder {
    graph: GraphInstance,
    worker_threads: usize,
    runtime: Option<tokio::runtime::Handle>,
    factories: HashMap<ActorKindId, Factory>,
}

impl SystemBuilder {
    pub fn new(graph: GraphInstance) -> Self {
        Self {
            graph,
            worker_threads: 2,
            runtime: None,
            factories: HashMap::new(),
        }
    }

    /// Number of background execution groups. Zero puts every actor on
    /// the cooperative main group.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Runtime for background tasks. Defaults to the ambient runtime at
    /// [`build`](Self::build) time.
    pub fn runtime_handle(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Registers the factory producing state (and handler registrations)
    /// for every instance of `kind`.
    pub fn register<S: Actor>(
        &mut self,
        kind: ActorKindId,
        mut factory: impl FnMut(&mut SetupContext<'_, S>) -> S + 'static,
    ) -> Result<&mut Self, SystemError> {
        if self.factories.contains_key(&kind) {
            return Err(SystemError::DuplicateFactory {
                kind: self.kind_name(kind),
            });
        }
        let wrapper: Factory = Box::new(move |seed: SetupSeed<'_>| {
            let mut setup = SetupContext::from_seed(seed);
            let state = factory(&mut setup);
            let (cell, sources) = setup.into_cell(state);
            (Box::new(cell) as Box<dyn Runnable>, sources)
        });
        self.factories.insert(kind, wrapper);
        Ok(self)
    }

    /// Instantiates the built-in service actors and one cell per graph
    /// actor, wires them to the scheduler, and runs initialize hooks.
    pub fn build(self) -> Result<ActorSystem, SystemError> {
        let SystemBuilder {
            graph,
            worker_threads,
            runtime,
            mut factories,
        } = self;

        let runtime = match runtime {
            Some(handle) => handle,
            None => tokio::runtime::Handle::try_current().map_err(|_| SystemError::NoRuntime)?,
        };

        let scheduler = Arc::new(Scheduler::new(worker_threads));
        let relay_id = ActorId::from_index(graph.actor_count());
        let dispatcher_id = ActorId::from_index(graph.actor_count() + 1);

        let mut mailboxes: HashMap<ActorId, Arc<Mailbox>> = graph
            .actor_ids()
            .map(|id| (id, Arc::new(Mailbox::new())))
            .collect();
        let relay_mailbox = Arc::new(Mailbox::new());
        mailboxes.insert(relay_id, Arc::clone(&relay_mailbox));
        mailboxes.insert(dispatcher_id, Arc::new(Mailbox::new()));
        let fabric = Arc::new(Fabric::new(mailboxes, Arc::clone(&scheduler)));

        let token = CancellationToken::new();
        let core = Arc::new(DispatcherCore::new(
            dispatcher_id,
            token.clone(),
            Arc::clone(&scheduler),
        ));
        let main = MainThreadHandle::new(Arc::clone(&core));

        // Built-in service actors first: their mailboxes must drain even
        // while user actors are still being constructed.
        scheduler.add(
            relay_id,
            Box::new(RelayCell::new(relay_id, relay_mailbox, Arc::clone(&fabric))),
            false,
        );
        scheduler.add(
            dispatcher_id,
            Box::new(DispatcherCell::new(core, runtime.clone())),
            true,
        );

        let mut sources_by_actor: Vec<(ActorId, Vec<Arc<dyn AsyncSource>>)> = Vec::new();
        for id in graph.actor_ids() {
            let Some(node) = graph.actor(id) else { continue };
            let main_thread = graph
                .catalog()
                .actor(node.kind)
                .map(|kind| kind.main_thread)
                .unwrap_or(false);
            let factory = factories
                .get_mut(&node.kind)
                .ok_or_else(|| SystemError::MissingFactory {
                    kind: node.name.clone(),
                })?;

            let (cell, sources) = factory(SetupSeed {
                id,
                graph: &graph,
                fabric: &fabric,
                token: &token,
                runtime: &runtime,
                relay: relay_id,
                main: &main,
            });
            debug!(actor = %id, kind = %node.name, main_thread, "actor instantiated");
            scheduler.add(id, cell, main_thread);
            if !sources.is_empty() {
                sources_by_actor.push((id, sources));
            }
        }

        info!(
            actors = graph.actor_count(),
            diagnostics = graph.diagnostics().len(),
            "actor system built"
        );

        Ok(ActorSystem {
            graph: Arc::new(graph),
            scheduler,
            token,
            runtime,
            main,
            sources: sources_by_actor,
            drivers: Vec::new(),
            started: false,
        })
    }

    fn kind_name(&self, kind: ActorKindId) -> String {
        self.graph
            .catalog()
            .actor(kind)
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| kind.to_string())
    }
}

/// The running system: owns the scheduler, the fabric, and the ambient
/// cancellation token.
pub struct ActorSystem {
    graph: Arc<GraphInstance>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
    runtime: tokio::runtime::Handle,
    main: MainThreadHandle,
    sources: Vec<(ActorId, Vec<Arc<dyn AsyncSource>>)>,
    drivers: Vec<tokio::task::JoinHandle<()>>,
    started: bool,
}

impl ActorSystem {
    /// Runs every actor's start hook, spawns the async drivers, and
    /// starts the worker threads.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.scheduler.for_each_cell(|_, cell| cell.start());
        for (actor, sources) in self.sources.drain(..) {
            self.drivers.push(spawn_driver(
                &self.runtime,
                Arc::clone(&self.scheduler),
                actor,
                sources,
                self.token.clone(),
            ));
        }
        self.scheduler.start();
        self.started = true;
        info!("actor system started");
    }

    /// One deadline-bounded pass over the main-thread group. The host
    /// calls this once per frame/cycle from its main context.
    pub fn tick(&self, deadline: Instant) {
        self.scheduler.tick_main(deadline);
    }

    /// Wakes a waiting actor. Idempotent, safe from any thread.
    pub fn wake(&self, id: ActorId) {
        self.scheduler.wake(id);
    }

    /// The ambient cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Handle for requesting main-thread execution from any thread.
    pub fn main_thread(&self) -> MainThreadHandle {
        self.main.clone()
    }

    pub fn graph(&self) -> &GraphInstance {
        &self.graph
    }

    /// Cancels the ambient token and wakes everything so pending work
    /// resolves with the cancellation failure kind.
    pub fn cancel(&self) {
        self.token.cancel();
        self.scheduler.wake_all();
    }

    /// Cancels, stops the worker threads, then runs every actor's
    /// teardown pass (failing whatever is still pending) and stop hook.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.cancel();
        self.scheduler.stop();
        self.scheduler.for_each_cell(|_, cell| cell.stop());
        self.started = false;
        info!("actor system stopped");
    }

    /// Stops, then runs shutdown hooks in reverse construction order and
    /// aborts any lingering async drivers.
    pub fn shutdown(&mut self) {
        self.stop();
        self.scheduler.for_each_cell_rev(|_, cell| cell.shutdown());
        for driver in self.drivers.drain(..) {
            driver.abort();
        }
        info!("actor system shut down");
    }

    /// Runs `f` against the first actor whose state is a `T`.
    pub fn with_state<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.scheduler.with_state(f)
    }
}

impl Drop for ActorSystem {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
        for driver in self.drivers.drain(..) {
            driver.abort();
        }
    }
}
