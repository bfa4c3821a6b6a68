//! Bridge between background async work and the cooperative tick loop.
//!
//! A background-capable component implements [`AsyncSource`]: an async
//! wait that resolves when the component has something for its actor.
//! One driver task per actor keeps exactly one outstanding wait per
//! source; when any wait resolves the driver wakes the actor (whose next
//! tick drains the results) and immediately re-arms that source. No
//! busy-polling, and no missed notification — the wait primitives count
//! their signals.

use std::sync::Arc;

use actor_graph::ActorId;
use async_trait::async_trait;
use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::scheduler::Scheduler;

/// What a resolved wait tells the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// More signals may come; re-arm the wait.
    Continuing,
    /// The source is done (normally after cancellation and final drain);
    /// stop waiting on it.
    Completed,
}

/// A background source feeding an actor.
///
/// `wait_signal` and the actor's tick may run simultaneously on
/// different threads; any data they share is the source's own
/// responsibility to synchronize (which is why sources are handed
/// around as `Arc`s with interior locking).
#[async_trait]
pub trait AsyncSource: Send + Sync {
    async fn wait_signal(&self, token: CancellationToken) -> WaitOutcome;
}

/// Spawns the driver task for one actor's sources. Exits once every
/// source has completed.
pub(crate) fn spawn_driver(
    runtime: &tokio::runtime::Handle,
    scheduler: Arc<Scheduler>,
    actor: ActorId,
    sources: Vec<Arc<dyn AsyncSource>>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    runtime.spawn(async move {
        let arm = |index: usize, source: Arc<dyn AsyncSource>, token: CancellationToken| {
            async move { (index, source.wait_signal(token).await) }.boxed()
        };

        let mut pending: Vec<BoxFuture<'static, (usize, WaitOutcome)>> = sources
            .iter()
            .enumerate()
            .map(|(index, source)| arm(index, Arc::clone(source), token.clone()))
            .collect();

        while !pending.is_empty() {
            let ((index, outcome), _, rest) = select_all(pending).await;
            pending = rest;

            scheduler.wake(actor);

            if outcome == WaitOutcome::Continuing {
                pending.push(arm(index, Arc::clone(&sources[index]), token.clone()));
            }
        }
        debug!(actor = %actor, "async driver finished");
    })
}
