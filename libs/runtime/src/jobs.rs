//! Background job pool: hands blocking or long-running async work off
//! the cooperative loop and delivers completions back on the owning
//! actor's own tick.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::bridge::{AsyncSource, WaitOutcome};
use crate::error::JobError;
use crate::scheduler::{enough_time, TickResult};
use crate::signal::MpscSignal;

/// Default attempts a job gets after failing with
/// [`JobError::ResourceExhausted`] before the error surfaces. Bounded so
/// sustained resource pressure cannot starve other waiters forever.
pub const DEFAULT_RETRY_BUDGET: u32 = 8;

type WorkFn = Box<
    dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Box<dyn Any + Send>, JobError>>
        + Send
        + Sync,
>;
type CompleteFn<S> = Box<dyn FnOnce(&mut S, Result<Box<dyn Any + Send>, JobError>) + Send>;

struct Job<S> {
    work: WorkFn,
    complete: CompleteFn<S>,
    attempts_left: u32,
}

struct Finished<S> {
    complete: CompleteFn<S>,
    outcome: Result<Box<dyn Any + Send>, JobError>,
}

struct PoolState<S> {
    waiting: VecDeque<Job<S>>,
    active: usize,
    completed: VecDeque<Finished<S>>,
}

/// Bounded-concurrency pool of background jobs owned by one actor.
///
/// Completions are invoked with `&mut S` during the actor's tick, so job
/// results never touch actor state from a background thread. The pool is
/// an [`AsyncSource`]: every completion signals the driver, which wakes
/// the actor.
pub struct JobPool<S> {
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for JobPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<S> {
    state: Mutex<PoolState<S>>,
    signal: MpscSignal,
    token: CancellationToken,
    runtime: tokio::runtime::Handle,
    concurrency: usize,
    retry_budget: u32,
}

impl<S: 'static> JobPool<S> {
    pub(crate) fn new(
        runtime: tokio::runtime::Handle,
        token: CancellationToken,
        concurrency: usize,
        retry_budget: u32,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    waiting: VecDeque::new(),
                    active: 0,
                    completed: VecDeque::new(),
                }),
                signal: MpscSignal::new(),
                token,
                runtime,
                concurrency: concurrency.max(1),
                retry_budget,
            }),
        }
    }

    /// Submits one job. `work` runs on the background runtime with the
    /// ambient token; `complete` runs later on the actor's tick with the
    /// outcome. A [`JobError::ResourceExhausted`] outcome re-queues the
    /// job (re-invoking `work`) until the retry budget runs out.
    ///
    /// A submit that loses the race against cancellation fails fast: the
    /// completion is queued immediately with [`JobError::Cancelled`].
    pub fn submit<R, W, F, C>(&self, work: W, complete: C)
    where
        R: Send + 'static,
        W: Fn(CancellationToken) -> F + Send + Sync + 'static,
        F: Future<Output = Result<R, JobError>> + Send + 'static,
        C: FnOnce(&mut S, Result<R, JobError>) + Send + 'static,
    {
        let work: WorkFn = Box::new(move |token| {
            let fut = work(token);
            async move { fut.await.map(|result| Box::new(result) as Box<dyn Any + Send>) }.boxed()
        });
        let complete: CompleteFn<S> = Box::new(move |state, outcome| match outcome {
            Ok(any) => match any.downcast::<R>() {
                Ok(result) => complete(state, Ok(*result)),
                Err(_) => error!("job result failed to downcast to its submitted type"),
            },
            Err(error) => complete(state, Err(error)),
        });
        let job = Job {
            work,
            complete,
            attempts_left: self.inner.retry_budget,
        };

        let inner = &self.inner;
        let mut state = inner.state.lock();
        if inner.token.is_cancelled() {
            state.completed.push_back(Finished {
                complete: job.complete,
                outcome: Err(JobError::Cancelled),
            });
            drop(state);
            inner.signal.set();
            return;
        }
        if state.active < inner.concurrency {
            state.active += 1;
            drop(state);
            Self::spawn_job(inner, job);
        } else {
            state.waiting.push_back(job);
        }
    }

    /// Runs due completions with the actor's state. Starts one waiting
    /// job per freed slot.
    pub(crate) fn drain(&self, state_obj: &mut S, deadline: Instant) -> TickResult {
        loop {
            if !enough_time(deadline) {
                return if self.inner.state.lock().completed.is_empty() {
                    TickResult::Wait
                } else {
                    TickResult::Yield
                };
            }

            let finished = {
                let mut state = self.inner.state.lock();
                let Some(finished) = state.completed.pop_front() else {
                    return TickResult::Wait;
                };
                if state.active < self.inner.concurrency {
                    if let Some(next) = state.waiting.pop_front() {
                        state.active += 1;
                        drop(state);
                        Self::spawn_job(&self.inner, next);
                    }
                }
                finished
            };

            let complete = finished.complete;
            let outcome = finished.outcome;
            if catch_unwind(AssertUnwindSafe(|| complete(state_obj, outcome))).is_err() {
                error!("job completion panicked");
            }
        }
    }

    /// Teardown: resolves queued jobs with cancellation and flushes any
    /// already-finished completions, so nothing the pool owns is leaked.
    pub(crate) fn fail_outstanding(&self, state_obj: &mut S) {
        let (waiting, completed) = {
            let mut state = self.inner.state.lock();
            let waiting: Vec<Job<S>> = state.waiting.drain(..).collect();
            let completed: Vec<Finished<S>> = state.completed.drain(..).collect();
            (waiting, completed)
        };
        for job in waiting {
            (job.complete)(state_obj, Err(JobError::Cancelled));
        }
        for finished in completed {
            (finished.complete)(state_obj, finished.outcome);
        }
    }

    fn spawn_job(inner: &Arc<PoolInner<S>>, job: Job<S>) {
        let pool = Arc::clone(inner);
        let token = inner.token.clone();
        inner.runtime.spawn(async move {
            let outcome = (job.work)(token).await;
            Self::finish(&pool, job, outcome);
        });
    }

    fn finish(
        inner: &Arc<PoolInner<S>>,
        mut job: Job<S>,
        outcome: Result<Box<dyn Any + Send>, JobError>,
    ) {
        let mut state = inner.state.lock();
        state.active -= 1;

        let retry = matches!(outcome, Err(JobError::ResourceExhausted))
            && job.attempts_left > 0
            && !inner.token.is_cancelled();
        if retry {
            job.attempts_left -= 1;
            warn!(
                attempts_left = job.attempts_left,
                "job failed on resource exhaustion; re-queueing"
            );
            if state.active < inner.concurrency {
                state.active += 1;
                drop(state);
                Self::spawn_job(inner, job);
            } else {
                state.waiting.push_back(job);
            }
            return;
        }

        state.completed.push_back(Finished {
            complete: job.complete,
            outcome,
        });
        drop(state);
        inner.signal.set();
    }
}

#[async_trait]
impl<S: 'static> AsyncSource for JobPool<S> {
    async fn wait_signal(&self, token: CancellationToken) -> WaitOutcome {
        if self.inner.signal.wait(&token).await.is_err() {
            // Cancelled: fail everything still queued, then keep draining
            // until in-flight jobs land.
            let idle = {
                let mut state = self.inner.state.lock();
                let waiting: Vec<Job<S>> = state.waiting.drain(..).collect();
                for job in waiting {
                    state.completed.push_back(Finished {
                        complete: job.complete,
                        outcome: Err(JobError::Cancelled),
                    });
                }
                state.active == 0
            };
            if idle {
                return WaitOutcome::Completed;
            }
            if self.inner.signal.wait(&CancellationToken::new()).await.is_err() {
                return WaitOutcome::Completed;
            }
        }
        WaitOutcome::Continuing
    }
}
