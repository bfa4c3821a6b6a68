//! Multiple-producer/single-consumer wake signal.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Counting wake-up signal: producers call [`set`](MpscSignal::set) from
/// any thread, one consumer awaits. Every `set` is remembered — two sets
/// before a wait complete two waits, so a burst of notifications can
/// never collapse below the data it announces.
#[derive(Default)]
pub struct MpscSignal {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    permits: usize,
    waiter: Option<oneshot::Sender<()>>,
}

impl MpscSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the consumer, or banks a permit if nobody is waiting.
    pub fn set(&self) {
        let waiter = {
            let mut state = self.inner.lock();
            match state.waiter.take() {
                Some(waiter) => waiter,
                None => {
                    state.permits += 1;
                    return;
                }
            }
        };
        // The waiter may have abandoned the wait (cancellation); the
        // signal must not be lost.
        if waiter.send(()).is_err() {
            self.inner.lock().permits += 1;
        }
    }

    /// Waits for one signal. Consumes a banked permit immediately when
    /// one exists. `Err` means the token was cancelled first.
    ///
    /// Single-consumer: a new wait replaces any abandoned one.
    pub async fn wait(&self, token: &CancellationToken) -> Result<(), Cancelled> {
        let rx = {
            let mut state = self.inner.lock();
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            rx
        };

        tokio::select! {
            _ = token.cancelled() => Err(Cancelled),
            res = rx => res.map_err(|_| Cancelled),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.lock().permits > 0
    }
}

/// The wait was abandoned because the token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn banked_permits_complete_waits_immediately() {
        let signal = MpscSignal::new();
        let token = CancellationToken::new();

        signal.set();
        signal.set();
        assert!(signal.is_signaled());

        signal.wait(&token).await.unwrap();
        signal.wait(&token).await.unwrap();
        assert!(!signal.is_signaled());
    }

    #[tokio::test]
    async fn set_wakes_a_parked_waiter() {
        let signal = Arc::new(MpscSignal::new());

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait(&CancellationToken::new()).await })
        };
        // Give the waiter a moment to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set();

        waiter.await.unwrap().unwrap();
        // The set was consumed by the waiter, not banked.
        assert!(!signal.is_signaled());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let signal = MpscSignal::new();
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(signal.wait(&token).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn signal_sent_to_abandoned_wait_is_not_lost() {
        let signal = MpscSignal::new();
        let token = CancellationToken::new();
        token.cancel();

        // Park-and-cancel leaves a stale waiter behind.
        assert_eq!(signal.wait(&token).await, Err(Cancelled));
        signal.set();

        let fresh = CancellationToken::new();
        signal.wait(&fresh).await.unwrap();
    }
}
