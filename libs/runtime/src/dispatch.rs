//! Main-thread dispatch: lets any thread request that a function run on
//! the main-thread-affine context and get the value back asynchronously.
//!
//! A built-in main-thread actor drains pending actions each cycle.
//! Cancellation fails every not-yet-started action, cancels every
//! in-flight completion source, and wins races against concurrent
//! enqueue: an enqueue that loses observes the cancellation and fails
//! fast instead of queueing forever.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use actor_graph::ActorId;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::scheduler::{Runnable, Scheduler, TickResult};

type Action = Box<dyn FnOnce() + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

pub(crate) struct DispatcherCore {
    self_id: ActorId,
    token: CancellationToken,
    scheduler: Arc<Scheduler>,
    waiting: Mutex<Vec<Action>>,
    running: Mutex<HashMap<u64, CancelHook>>,
    next_running_id: AtomicU64,
}

impl DispatcherCore {
    pub(crate) fn new(
        self_id: ActorId,
        token: CancellationToken,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            self_id,
            token,
            scheduler,
            waiting: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            next_running_id: AtomicU64::new(0),
        }
    }

    /// Fails everything pending and in flight. Each drained action
    /// observes the cancelled token itself, so an action that raced its
    /// way into the queue after cancellation still resolves.
    fn cancel_all(&self) {
        let actions: Vec<Action> = self.waiting.lock().drain(..).collect();
        for action in actions {
            action();
        }
        let hooks: Vec<CancelHook> = self.running.lock().drain().map(|(_, hook)| hook).collect();
        for hook in hooks {
            hook();
        }
    }

    fn register_running(&self, hook: CancelHook) -> u64 {
        let id = self.next_running_id.fetch_add(1, Ordering::Relaxed);
        self.running.lock().insert(id, hook);
        id
    }

    fn unregister_running(&self, id: u64) {
        self.running.lock().remove(&id);
    }
}

/// Cloneable handle for requesting main-thread execution from anywhere.
#[derive(Clone)]
pub struct MainThreadHandle {
    core: Arc<DispatcherCore>,
}

impl MainThreadHandle {
    pub(crate) fn new(core: Arc<DispatcherCore>) -> Self {
        Self { core }
    }

    /// Queues `f` to run on the main thread; the returned future
    /// resolves with its value.
    pub fn run<R: Send + 'static>(
        &self,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> MainThreadTask<R> {
        self.run_with(move |completer| completer.complete(f()))
    }

    /// Like [`run`](Self::run), but `f` receives a [`Completer`] it may
    /// resolve later — for main-thread work whose result arrives from a
    /// callback rather than a return value.
    pub fn run_with<R: Send + 'static>(
        &self,
        f: impl FnOnce(Completer<R>) + Send + 'static,
    ) -> MainThreadTask<R> {
        let (tx, rx) = oneshot::channel::<Result<R, DispatchError>>();
        let task = MainThreadTask { receiver: rx };

        if self.core.token.is_cancelled() {
            let _ = tx.send(Err(DispatchError::Cancelled));
            return task;
        }

        let slot = Arc::new(Mutex::new(Some(tx)));
        let core = Arc::clone(&self.core);
        let action: Action = Box::new(move || {
            if core.token.is_cancelled() {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(Err(DispatchError::Cancelled));
                }
                return;
            }
            let hook_slot = Arc::clone(&slot);
            let id = core.register_running(Box::new(move || {
                if let Some(tx) = hook_slot.lock().take() {
                    let _ = tx.send(Err(DispatchError::Cancelled));
                }
            }));
            let completer = Completer {
                core: Arc::clone(&core),
                slot,
                id,
            };
            f(completer);
        });

        self.core.waiting.lock().push(action);
        if self.core.token.is_cancelled() {
            // Lost the race: make sure the freshly queued action sees it.
            self.core.cancel_all();
        }
        self.core.scheduler.wake(self.core.self_id);
        task
    }
}

/// Resolves one deferred main-thread result, exactly once. Cancellation
/// beats completion: a value completed after the token fired resolves
/// the caller with [`DispatchError::Cancelled`].
pub struct Completer<R: Send + 'static> {
    core: Arc<DispatcherCore>,
    slot: Arc<Mutex<Option<oneshot::Sender<Result<R, DispatchError>>>>>,
    id: u64,
}

impl<R: Send + 'static> Completer<R> {
    pub fn complete(self, value: R) {
        self.core.unregister_running(self.id);
        let cancelled = self.core.token.is_cancelled();
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(if cancelled {
                Err(DispatchError::Cancelled)
            } else {
                Ok(value)
            });
        }
    }
}

/// Future for a main-thread dispatch result.
pub struct MainThreadTask<R> {
    receiver: oneshot::Receiver<Result<R, DispatchError>>,
}

impl<R> Future for MainThreadTask<R> {
    type Output = Result<R, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|res| match res {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::Cancelled),
            })
    }
}

/// The built-in main-thread actor draining the pending actions.
pub(crate) struct DispatcherCell {
    core: Arc<DispatcherCore>,
    runtime: tokio::runtime::Handle,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl DispatcherCell {
    pub(crate) fn new(core: Arc<DispatcherCore>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            core,
            runtime,
            watcher: None,
        }
    }
}

impl Runnable for DispatcherCell {
    fn initialize(&mut self) {
        let core = Arc::clone(&self.core);
        self.watcher = Some(self.runtime.spawn(async move {
            core.token.cancelled().await;
            core.cancel_all();
            core.scheduler.wake(core.self_id);
        }));
    }

    fn start(&mut self) {}

    fn tick(&mut self, _deadline: Instant) -> TickResult {
        // Swap out under the lock, run outside it.
        let actions: Vec<Action> = self.core.waiting.lock().drain(..).collect();
        for action in actions {
            action();
        }
        TickResult::Wait
    }

    fn stop(&mut self) {
        self.core.cancel_all();
    }

    fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    fn state_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
