//! Delayed callbacks delivered on the owning actor's tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bridge::{AsyncSource, WaitOutcome};
use crate::scheduler::TickResult;
use crate::signal::MpscSignal;

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerState {
    pending: usize,
    ready: Vec<TimerCallback>,
}

/// Per-actor timer source. [`delay`](TimerQueue::delay) schedules a
/// callback; when it becomes due the owning actor is woken and runs it
/// during its next tick. Cancellation drops undelivered callbacks.
#[derive(Clone)]
pub struct TimerQueue {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    signal: MpscSignal,
    token: CancellationToken,
    runtime: tokio::runtime::Handle,
}

impl TimerQueue {
    pub(crate) fn new(runtime: tokio::runtime::Handle, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState {
                    pending: 0,
                    ready: Vec::new(),
                }),
                signal: MpscSignal::new(),
                token,
                runtime,
            }),
        }
    }

    pub fn delay(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        if self.inner.token.is_cancelled() {
            return;
        }
        self.inner.state.lock().pending += 1;

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut state = inner.state.lock();
                        state.pending -= 1;
                        state.ready.push(Box::new(callback));
                    }
                    inner.signal.set();
                }
                _ = inner.token.cancelled() => {
                    inner.state.lock().pending -= 1;
                    inner.signal.set();
                }
            }
        });
    }

    /// Runs due callbacks. Cheap when nothing is due.
    pub(crate) fn drain(&self) -> TickResult {
        let ready = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.ready)
        };
        for callback in ready {
            callback();
        }
        TickResult::Wait
    }
}

#[async_trait]
impl AsyncSource for TimerQueue {
    async fn wait_signal(&self, token: CancellationToken) -> WaitOutcome {
        if self.inner.signal.wait(&token).await.is_err() {
            let idle = {
                let state = self.inner.state.lock();
                state.pending == 0 && state.ready.is_empty()
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
