//! Async bridging, background jobs, timers, main-thread dispatch, and
//! system-wide cancellation.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use actor_graph::{components, ActorKind, ActorKindId, Catalog, GraphBuilder};
use actor_runtime::{
    Actor, AsyncSource, CancellationToken, DispatchError, JobError, MpscSignal, NetOutput,
    RpcContext, RpcOutput, SystemBuilder, TickResult, TimerQueue, WaitOutcome,
};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use common::{run_until, settle, tick};

const SOURCE_OWNER: ActorKindId = ActorKindId(Uuid::from_u128(0x60));

/// A background source the tests push into by hand.
struct PushSource {
    queue: Mutex<VecDeque<u32>>,
    signal: MpscSignal,
}

impl PushSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            signal: MpscSignal::new(),
        })
    }

    fn push(&self, value: u32) {
        self.queue.lock().push_back(value);
        self.signal.set();
    }

    fn drain(&self) -> Vec<u32> {
        self.queue.lock().drain(..).collect()
    }
}

#[async_trait]
impl AsyncSource for PushSource {
    async fn wait_signal(&self, token: CancellationToken) -> WaitOutcome {
        match self.signal.wait(&token).await {
            Ok(()) => WaitOutcome::Continuing,
            Err(_) => WaitOutcome::Completed,
        }
    }
}

struct SourceOwner {
    source: Arc<PushSource>,
    seen: Vec<u32>,
    ticks: u32,
}

impl Actor for SourceOwner {
    fn tick(&mut self, _deadline: std::time::Instant) -> TickResult {
        self.ticks += 1;
        self.seen.extend(self.source.drain());
        TickResult::Wait
    }
}

#[tokio::test]
async fn burst_of_signals_before_a_tick_loses_nothing() -> Result<()> {
    let mut catalog = Catalog::with_standard_components();
    catalog.add_actor(ActorKind::new(SOURCE_OWNER, "SourceOwner"))?;
    let mut graph = GraphBuilder::new(catalog);
    graph.add_actor(SOURCE_OWNER)?;

    let source = PushSource::new();
    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    let registered = Arc::clone(&source);
    builder.register::<SourceOwner>(SOURCE_OWNER, move |ctx| {
        ctx.add_source(Arc::clone(&registered) as Arc<dyn AsyncSource>);
        SourceOwner {
            source: Arc::clone(&registered),
            seen: Vec::new(),
            ticks: 0,
        }
    })?;
    let mut system = builder.build()?;
    system.start();

    // Let the owner go idle first so the delivery below really exercises
    // the wake path.
    settle(&system).await;
    let idle_ticks = system
        .with_state::<SourceOwner, _>(|s| s.ticks)
        .expect("owner state");

    // Two results arrive in rapid succession before the owner runs.
    source.push(1);
    source.push(2);

    run_until(&system, "both results observed", || {
        system
            .with_state::<SourceOwner, _>(|s| s.seen == vec![1, 2])
            .unwrap_or(false)
    })
    .await;
    assert!(
        system.with_state::<SourceOwner, _>(|s| s.ticks).expect("owner state") > idle_ticks
    );

    system.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs

const WORKER: ActorKindId = ActorKindId(Uuid::from_u128(0x61));

struct JobOwner {
    results: Vec<Result<u32, JobError>>,
}

impl Actor for JobOwner {}

fn job_owner_graph() -> Result<GraphBuilder> {
    let mut catalog = Catalog::with_standard_components();
    catalog.add_actor(ActorKind::new(WORKER, "JobOwner"))?;
    let mut graph = GraphBuilder::new(catalog);
    graph.add_actor(WORKER)?;
    Ok(graph)
}

#[tokio::test]
async fn job_completions_run_on_the_owning_actor() -> Result<()> {
    let graph = job_owner_graph()?;
    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    builder.register::<JobOwner>(WORKER, |ctx| {
        let jobs = ctx.jobs();
        for value in [10u32, 20u32] {
            jobs.submit(
                move |_token| async move { Ok(value) },
                |state: &mut JobOwner, outcome| state.results.push(outcome),
            );
        }
        JobOwner { results: Vec::new() }
    })?;
    let mut system = builder.build()?;
    system.start();

    run_until(&system, "both jobs complete", || {
        system
            .with_state::<JobOwner, _>(|s| s.results.len() == 2)
            .unwrap_or(false)
    })
    .await;
    system
        .with_state::<JobOwner, _>(|s| {
            let mut values: Vec<u32> = s.results.iter().map(|r| *r.as_ref().unwrap()).collect();
            values.sort_unstable();
            assert_eq!(values, vec![10, 20]);
        })
        .expect("owner state");

    system.shutdown();
    Ok(())
}

#[tokio::test]
async fn resource_exhaustion_retries_are_bounded() -> Result<()> {
    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let graph = job_owner_graph()?;
    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    let job_attempts = Arc::clone(&attempts);
    builder.register::<JobOwner>(WORKER, move |ctx| {
        let jobs = ctx.jobs_with(2, 3);
        let job_attempts = Arc::clone(&job_attempts);
        jobs.submit(
            move |_token| {
                let job_attempts = Arc::clone(&job_attempts);
                async move {
                    job_attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    Err::<u32, _>(JobError::ResourceExhausted)
                }
            },
            |state: &mut JobOwner, outcome| state.results.push(outcome),
        );
        JobOwner { results: Vec::new() }
    })?;
    let mut system = builder.build()?;
    system.start();

    run_until(&system, "the exhausted job surfaces its error", || {
        system
            .with_state::<JobOwner, _>(|s| !s.results.is_empty())
            .unwrap_or(false)
    })
    .await;

    system
        .with_state::<JobOwner, _>(|s| {
            assert!(matches!(s.results[0], Err(JobError::ResourceExhausted)));
        })
        .expect("owner state");
    // Initial attempt plus the three budgeted retries.
    assert_eq!(attempts.load(std::sync::atomic::Ordering::Relaxed), 4);

    system.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Timers

const DELAYED: ActorKindId = ActorKindId(Uuid::from_u128(0x62));
const DELAYED_SINK: ActorKindId = ActorKindId(Uuid::from_u128(0x63));

#[derive(Debug)]
struct Ping {
    value: i32,
}

struct DelayedSender {
    out: NetOutput<Ping>,
    timer: TimerQueue,
}

impl Actor for DelayedSender {
    fn start(&mut self) {
        self.out
            .send_delayed(&self.timer, Duration::from_millis(30), Ping { value: 7 });
    }
}

struct Sink {
    seen: Vec<i32>,
}

impl Actor for Sink {}

#[tokio::test]
async fn delayed_sends_arrive_after_the_delay() -> Result<()> {
    let mut catalog = Catalog::with_standard_components();
    catalog.add_actor(ActorKind::new(DELAYED, "DelayedSender").with_output::<Ping>(components::NET))?;
    catalog.add_actor(ActorKind::new(DELAYED_SINK, "Sink").with_input::<Ping>(components::NET))?;
    let mut graph = GraphBuilder::new(catalog);
    let sender = graph.add_actor(DELAYED)?;
    let sink = graph.add_actor(DELAYED_SINK)?;
    graph.connect_net::<Ping>(sender, sink)?;

    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    builder.register::<DelayedSender>(DELAYED, |ctx| DelayedSender {
        out: ctx.net_output::<Ping>(),
        timer: ctx.timer(),
    })?;
    builder.register::<Sink>(DELAYED_SINK, |ctx| {
        ctx.net_input::<Ping>(|state: &mut Sink, msg| state.seen.push(msg.value));
        Sink { seen: Vec::new() }
    })?;
    let mut system = builder.build()?;
    system.start();

    run_until(&system, "delayed ping arrives", || {
        system
            .with_state::<Sink, _>(|s| s.seen == vec![7])
            .unwrap_or(false)
    })
    .await;

    system.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Main-thread dispatch

const IDLER: ActorKindId = ActorKindId(Uuid::from_u128(0x64));

struct Idler;

impl Actor for Idler {}

fn idler_system() -> Result<SystemBuilder> {
    let mut catalog = Catalog::with_standard_components();
    catalog.add_actor(ActorKind::new(IDLER, "Idler"))?;
    let mut graph = GraphBuilder::new(catalog);
    graph.add_actor(IDLER)?;
    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    builder.register::<Idler>(IDLER, |_ctx| Idler)?;
    Ok(builder)
}

#[tokio::test]
async fn main_thread_dispatch_runs_on_the_ticking_thread() -> Result<()> {
    let mut system = idler_system()?.build()?;
    system.start();

    let main_thread = std::thread::current().id();
    let task = system.main_thread().run(move || {
        assert_eq!(std::thread::current().id(), main_thread);
        42
    });
    let waiter = tokio::spawn(task);

    run_until(&system, "dispatch completes", || waiter.is_finished()).await;
    assert_eq!(waiter.await?, Ok(42));

    system.shutdown();
    Ok(())
}

#[tokio::test]
async fn enqueue_after_cancellation_fails_fast() -> Result<()> {
    let mut system = idler_system()?.build()?;
    system.start();
    system.cancel();

    let task = system.main_thread().run(|| 1);
    // No ticking at all: the cancelled token must already have resolved it.
    assert_eq!(task.await, Err(DispatchError::Cancelled));

    system.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// System-wide cancellation: N pending rpc calls and M pending main-thread
// actions all resolve with the cancellation failure kind, exactly once.

const CANCEL_CALLER: ActorKindId = ActorKindId(Uuid::from_u128(0x65));
const BLACKHOLE: ActorKindId = ActorKindId(Uuid::from_u128(0x66));

#[derive(Debug)]
struct Query {
    id: u64,
}

#[derive(Debug, Clone)]
struct Answer;

struct CancelCaller {
    query: RpcOutput<Query, Answer>,
    successes: u32,
    cancellations: u32,
    other_failures: u32,
}

impl Actor for CancelCaller {
    fn start(&mut self) {
        for id in 0..3 {
            self.query
                .call((), (), Query { id })
                .on_success(|state: &mut CancelCaller, (), (), _answer| state.successes += 1)
                .on_failure(|state: &mut CancelCaller, (), (), error| {
                    if error.is_cancelled() {
                        state.cancellations += 1;
                    } else {
                        state.other_failures += 1;
                    }
                });
        }
    }
}

/// Accepts requests and parks them forever.
struct Blackhole {
    parked: Vec<RpcContext<Query, Answer>>,
}

impl Actor for Blackhole {}

#[tokio::test]
async fn cancellation_resolves_every_pending_call_and_action() -> Result<()> {
    common::init_tracing();
    let mut catalog = Catalog::with_standard_components();
    catalog
        .add_actor(ActorKind::new(CANCEL_CALLER, "Caller").with_output::<Query>(components::RPC))?;
    catalog.add_actor(ActorKind::new(BLACKHOLE, "Blackhole").with_input::<Query>(components::RPC))?;
    let mut graph = GraphBuilder::new(catalog);
    let caller = graph.add_actor(CANCEL_CALLER)?;
    let blackhole = graph.add_actor(BLACKHOLE)?;
    graph.connect_rpc::<Query>(caller, blackhole)?;

    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    builder.register::<CancelCaller>(CANCEL_CALLER, |ctx| CancelCaller {
        query: ctx.rpc_output::<Query, Answer>(),
        successes: 0,
        cancellations: 0,
        other_failures: 0,
    })?;
    builder.register::<Blackhole>(BLACKHOLE, |ctx| {
        ctx.rpc_input::<Query, Answer>(|state: &mut Blackhole, request| {
            state.parked.push(request);
        });
        Blackhole { parked: Vec::new() }
    })?;
    let mut system = builder.build()?;
    system.start();

    // Let the three calls reach the blackhole and sit there.
    run_until(&system, "requests parked", || {
        system
            .with_state::<Blackhole, _>(|b| b.parked.len() == 3)
            .unwrap_or(false)
    })
    .await;

    // Two main-thread actions, still pending.
    let first = tokio::spawn(system.main_thread().run(|| 1));
    let second = tokio::spawn(system.main_thread().run(|| 2));

    system.cancel();

    run_until(&system, "all rpc calls resolve with cancellation", || {
        system
            .with_state::<CancelCaller, _>(|c| c.cancellations == 3)
            .unwrap_or(false)
    })
    .await;
    run_until(&system, "main-thread actions resolve", || {
        first.is_finished() && second.is_finished()
    })
    .await;
    assert_eq!(first.await?, Err(DispatchError::Cancelled));
    assert_eq!(second.await?, Err(DispatchError::Cancelled));

    // Nothing further fires afterwards.
    settle(&system).await;
    system
        .with_state::<CancelCaller, _>(|c| {
            assert_eq!(c.successes, 0);
            assert_eq!(c.cancellations, 3);
            assert_eq!(c.other_failures, 0);
        })
        .expect("caller state");

    system.shutdown();
    Ok(())
}

#[tokio::test]
async fn stop_fails_pending_calls_with_cancellation() -> Result<()> {
    let mut catalog = Catalog::with_standard_components();
    catalog
        .add_actor(ActorKind::new(CANCEL_CALLER, "Caller").with_output::<Query>(components::RPC))?;
    catalog.add_actor(ActorKind::new(BLACKHOLE, "Blackhole").with_input::<Query>(components::RPC))?;
    let mut graph = GraphBuilder::new(catalog);
    let caller = graph.add_actor(CANCEL_CALLER)?;
    let blackhole = graph.add_actor(BLACKHOLE)?;
    graph.connect_rpc::<Query>(caller, blackhole)?;

    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    builder.register::<CancelCaller>(CANCEL_CALLER, |ctx| CancelCaller {
        query: ctx.rpc_output::<Query, Answer>(),
        successes: 0,
        cancellations: 0,
        other_failures: 0,
    })?;
    builder.register::<Blackhole>(BLACKHOLE, |ctx| {
        ctx.rpc_input::<Query, Answer>(|state: &mut Blackhole, request| {
            state.parked.push(request);
        });
        Blackhole { parked: Vec::new() }
    })?;
    let mut system = builder.build()?;
    system.start();

    run_until(&system, "requests parked", || {
        system
            .with_state::<Blackhole, _>(|b| b.parked.len() == 3)
            .unwrap_or(false)
    })
    .await;

    // Stop without any cooperative ticking afterwards: the teardown pass
    // itself must resolve the records.
    system.stop();
    system
        .with_state::<CancelCaller, _>(|c| {
            assert_eq!(c.cancellations, 3);
            assert_eq!(c.successes, 0);
        })
        .expect("caller state");

    system.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Main-thread affinity

const MAIN_BOUND: ActorKindId = ActorKindId(Uuid::from_u128(0x67));
const BACKGROUND: ActorKindId = ActorKindId(Uuid::from_u128(0x68));

struct ThreadProbe {
    seen_on: Arc<Mutex<Vec<ThreadId>>>,
}

impl Actor for ThreadProbe {
    fn tick(&mut self, _deadline: std::time::Instant) -> TickResult {
        self.seen_on.lock().push(std::thread::current().id());
        TickResult::Wait
    }
}

#[tokio::test]
async fn main_thread_affine_actors_only_run_on_the_ticking_thread() -> Result<()> {
    let mut catalog = Catalog::with_standard_components();
    catalog.add_actor(ActorKind::new(MAIN_BOUND, "MainBound").on_main_thread())?;
    catalog.add_actor(ActorKind::new(BACKGROUND, "Background"))?;
    let mut graph = GraphBuilder::new(catalog);
    graph.add_actor(MAIN_BOUND)?;
    graph.add_actor(BACKGROUND)?;

    let main_log: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let background_log: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    let mut builder = SystemBuilder::new(graph.build()).worker_threads(2);
    let log = Arc::clone(&main_log);
    builder.register::<ThreadProbe>(MAIN_BOUND, move |_ctx| ThreadProbe {
        seen_on: Arc::clone(&log),
    })?;
    let log = Arc::clone(&background_log);
    builder.register::<ThreadProbe>(BACKGROUND, move |_ctx| ThreadProbe {
        seen_on: Arc::clone(&log),
    })?;
    let mut system = builder.build()?;
    system.start();

    run_until(&system, "both actors ticked", || {
        !main_log.lock().is_empty() && !background_log.lock().is_empty()
    })
    .await;

    let host_thread = std::thread::current().id();
    assert!(main_log.lock().iter().all(|id| *id == host_thread));
    assert!(background_log.lock().iter().all(|id| *id != host_thread));

    system.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Wake semantics at the system surface

const SLEEPY: ActorKindId = ActorKindId(Uuid::from_u128(0x69));

struct Sleepy {
    ticks: u32,
}

impl Actor for Sleepy {
    fn tick(&mut self, _deadline: std::time::Instant) -> TickResult {
        self.ticks += 1;
        TickResult::Wait
    }
}

#[tokio::test]
async fn repeated_wakes_collapse_into_one_scheduling() -> Result<()> {
    let mut catalog = Catalog::with_standard_components();
    catalog.add_actor(ActorKind::new(SLEEPY, "Sleepy"))?;
    let mut graph = GraphBuilder::new(catalog);
    let sleepy = graph.add_actor(SLEEPY)?;

    let mut builder = SystemBuilder::new(graph.build()).worker_threads(0);
    builder.register::<Sleepy>(SLEEPY, |_ctx| Sleepy { ticks: 0 })?;
    let mut system = builder.build()?;
    system.start();

    tick(&system);
    let after_first = system.with_state::<Sleepy, _>(|s| s.ticks).expect("sleepy state");

    // Waiting actor does not run again without a wake.
    tick(&system);
    assert_eq!(system.with_state::<Sleepy, _>(|s| s.ticks), Some(after_first));

    // Multiple wakes before the next tick produce exactly one run.
    system.wake(sleepy);
    system.wake(sleepy);
    system.wake(sleepy);
    tick(&system);
    assert_eq!(
        system.with_state::<Sleepy, _>(|s| s.ticks),
        Some(after_first + 1)
    );

    system.shutdown();
    Ok(())
}
