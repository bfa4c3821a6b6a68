//! Cooperative tick scheduler with execution groups.
//!
//! Group 0 is cooperative: it only runs when the host calls the tick
//! entry point from its designated main context, which is what gives
//! main-thread-affine actors their guarantee. Every other group owns a
//! worker thread with a fixed duty cycle.
//!
//! A single actor is owned by exactly one group and ticked under its
//! slot lock, so its state is never touched by two threads at once.
//! Cross-thread interaction with the scheduler is limited to the ready
//! flags and group signals, both safe from any thread.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use actor_graph::ActorId;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info};

/// What an actor's tick tells the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// More work remains; run again soon, but let siblings run first.
    Yield,
    /// Nothing to do until something wakes this actor.
    Wait,
}

/// Worker duty cycle. An actor tick receives `start + 90%` of this as
/// its deadline; the rest of the cycle is slept off.
const CYCLE: Duration = Duration::from_millis(10);

/// Backstop so a parked worker re-checks its queue periodically even if
/// a signal is somehow missed.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// Minimum remaining time for starting one more unit of work before a
/// deadline.
pub(crate) fn enough_time(deadline: Instant) -> bool {
    deadline
        .checked_duration_since(Instant::now())
        .is_some_and(|left| left > Duration::from_millis(1))
}

/// Lifecycle surface the scheduler drives. Implemented by actor cells
/// and the built-in service actors.
pub(crate) trait Runnable: Send {
    fn initialize(&mut self);
    fn start(&mut self);
    fn tick(&mut self, deadline: Instant) -> TickResult;
    fn stop(&mut self);
    fn shutdown(&mut self);
    /// The actor's state object, for the system's state accessors.
    fn state_any(&mut self) -> &mut dyn Any;
}

struct AutoResetEvent {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl AutoResetEvent {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.condvar.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock();
        if !*flag {
            self.condvar.wait_for(&mut flag, timeout);
        }
        *flag = false;
    }
}

struct Slot {
    id: ActorId,
    group: usize,
    ready: AtomicBool,
    cell: Mutex<Box<dyn Runnable>>,
}

struct Group {
    cooperative: bool,
    slots: Mutex<Vec<Arc<Slot>>>,
    /// Round-robin cursor. Only the owning execution context advances it;
    /// atomic for cross-thread visibility on start/stop edges.
    next: AtomicUsize,
    signal: AutoResetEvent,
    stopping: AtomicBool,
}

impl Group {
    fn new(cooperative: bool) -> Self {
        Self {
            cooperative,
            slots: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            signal: AutoResetEvent::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// One round-robin pass over ready actors. Returns false when the
    /// deadline cut an actor short (work remains).
    fn run_cycle(&self, deadline: Instant) -> bool {
        let slots: Vec<Arc<Slot>> = self.slots.lock().clone();
        if slots.is_empty() {
            return true;
        }

        let count = slots.len();
        let mut all_processed = true;
        for i in 0..count {
            let position = (self.next.load(Ordering::Relaxed) + 1) % count;
            self.next.store(position, Ordering::Relaxed);
            let slot = &slots[position];

            if !slot.ready.swap(false, Ordering::AcqRel) {
                continue;
            }

            let result = {
                let mut cell = slot.cell.lock();
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    cell.tick(deadline)
                })) {
                    Ok(result) => result,
                    Err(_) => {
                        error!(actor = %slot.id, "actor tick panicked; parking the actor");
                        TickResult::Wait
                    }
                }
            };

            if result == TickResult::Yield {
                slot.ready.store(true, Ordering::Release);
                all_processed = false;
                // The interrupted actor leads the next cycle, unless it
                // already ran first: every actor then gets a full cycle
                // at least once every N cycles.
                if i != 0 {
                    let back = if position == 0 { count - 1 } else { position - 1 };
                    self.next.store(back, Ordering::Relaxed);
                }
                break;
            }
        }
        all_processed
    }

    fn worker_loop(self: Arc<Self>) {
        let awake = CYCLE.mul_f32(0.9);
        while !self.stopping.load(Ordering::Acquire) {
            let start = Instant::now();
            let all_processed = self.run_cycle(start + awake);
            if !all_processed {
                self.signal.set();
            }

            let elapsed = start.elapsed();
            if elapsed < CYCLE {
                thread::sleep(CYCLE - elapsed);
            }
            self.signal.wait(PARK_TIMEOUT);
        }
    }
}

/// Owns the execution groups and the actor slot registry.
pub struct Scheduler {
    groups: Vec<Arc<Group>>,
    registry: RwLock<HashMap<ActorId, Arc<Slot>>>,
    /// Insertion order, for deterministic lifecycle sweeps and reverse
    /// shutdown.
    order: Mutex<Vec<Arc<Slot>>>,
    next_group: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// `worker_groups` background groups plus the cooperative main group.
    pub(crate) fn new(worker_groups: usize) -> Self {
        let mut groups = vec![Arc::new(Group::new(true))];
        groups.extend((0..worker_groups).map(|_| Arc::new(Group::new(false))));
        Self {
            groups,
            registry: RwLock::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            next_group: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Adds an actor. Main-thread-affine actors go to the cooperative
    /// group; others round-robin across worker groups. Runs the cell's
    /// initialize hook.
    pub(crate) fn add(&self, id: ActorId, mut cell: Box<dyn Runnable>, main_thread: bool) {
        cell.initialize();

        let group = if main_thread || self.groups.len() == 1 {
            0
        } else {
            1 + self.next_group.fetch_add(1, Ordering::Relaxed) % (self.groups.len() - 1)
        };
        debug!(actor = %id, group, main_thread, "adding actor to scheduler");

        let slot = Arc::new(Slot {
            id,
            group,
            ready: AtomicBool::new(true),
            cell: Mutex::new(cell),
        });
        self.registry.write().insert(id, Arc::clone(&slot));
        self.order.lock().push(Arc::clone(&slot));
        self.groups[group].slots.lock().push(slot);
        self.groups[group].signal.set();
    }

    /// Moves a waiting actor back into the runnable set at the next
    /// scheduling opportunity. Idempotent — wakes before the actor is
    /// rescheduled collapse into one — and safe from any thread,
    /// including async continuations.
    pub fn wake(&self, id: ActorId) {
        let Some(slot) = self.registry.read().get(&id).cloned() else {
            return;
        };
        slot.ready.store(true, Ordering::Release);
        self.groups[slot.group].signal.set();
    }

    pub(crate) fn wake_all(&self) {
        for slot in self.order.lock().iter() {
            slot.ready.store(true, Ordering::Release);
        }
        for group in &self.groups {
            group.signal.set();
        }
    }

    /// Starts the worker threads. The cooperative group has none; the
    /// host drives it through [`tick_main`](Self::tick_main).
    pub(crate) fn start(&self) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }
        for group in self.groups.iter().filter(|g| !g.cooperative) {
            group.stopping.store(false, Ordering::Release);
            let group = Arc::clone(group);
            threads.push(thread::spawn(move || group.worker_loop()));
        }
        info!(workers = threads.len(), "scheduler started");
    }

    pub(crate) fn stop(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        for group in &self.groups {
            group.stopping.store(true, Ordering::Release);
            group.signal.set();
        }
        for thread in threads {
            let _ = thread.join();
        }
        for group in &self.groups {
            group.stopping.store(false, Ordering::Release);
        }
        info!("scheduler stopped");
    }

    /// One cooperative pass over the main group, bounded by `deadline`.
    pub(crate) fn tick_main(&self, deadline: Instant) {
        self.groups[0].run_cycle(deadline);
    }

    pub(crate) fn for_each_cell(&self, mut f: impl FnMut(ActorId, &mut dyn Runnable)) {
        let slots: Vec<_> = self.order.lock().clone();
        for slot in slots {
            f(slot.id, &mut **slot.cell.lock());
        }
    }

    pub(crate) fn for_each_cell_rev(&self, mut f: impl FnMut(ActorId, &mut dyn Runnable)) {
        let slots: Vec<_> = self.order.lock().clone();
        for slot in slots.into_iter().rev() {
            f(slot.id, &mut **slot.cell.lock());
        }
    }

    /// Runs `f` against the first actor whose state is a `T`.
    pub(crate) fn with_state<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slots: Vec<_> = self.order.lock().clone();
        for slot in slots {
            let mut cell = slot.cell.lock();
            if let Some(state) = cell.state_any().downcast_mut::<T>() {
                return Some(f(state));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        ticks: u32,
        result: TickResult,
    }

    impl Runnable for Probe {
        fn initialize(&mut self) {}
        fn start(&mut self) {}
        fn tick(&mut self, _deadline: Instant) -> TickResult {
            self.ticks += 1;
            self.result
        }
        fn stop(&mut self) {}
        fn shutdown(&mut self) {}
        fn state_any(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn probe(result: TickResult) -> Box<Probe> {
        Box::new(Probe { ticks: 0, result })
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(5)
    }

    #[test]
    fn waiting_actor_ticks_once_until_woken() {
        let scheduler = Scheduler::new(0);
        let id = ActorId::from_index(0);
        scheduler.add(id, probe(TickResult::Wait), true);

        scheduler.tick_main(deadline());
        scheduler.tick_main(deadline());
        assert_eq!(scheduler.with_state::<Probe, _>(|p| p.ticks), Some(1));

        scheduler.wake(id);
        scheduler.tick_main(deadline());
        assert_eq!(scheduler.with_state::<Probe, _>(|p| p.ticks), Some(2));
    }

    #[test]
    fn multiple_wakes_collapse_into_one_tick() {
        let scheduler = Scheduler::new(0);
        let id = ActorId::from_index(0);
        scheduler.add(id, probe(TickResult::Wait), true);
        scheduler.tick_main(deadline());

        scheduler.wake(id);
        scheduler.wake(id);
        scheduler.wake(id);
        scheduler.tick_main(deadline());
        assert_eq!(scheduler.with_state::<Probe, _>(|p| p.ticks), Some(2));
    }

    #[test]
    fn yielding_actor_stays_runnable() {
        let scheduler = Scheduler::new(0);
        scheduler.add(ActorId::from_index(0), probe(TickResult::Yield), true);

        scheduler.tick_main(deadline());
        scheduler.tick_main(deadline());
        assert_eq!(scheduler.with_state::<Probe, _>(|p| p.ticks), Some(2));
    }

    #[test]
    fn wake_for_unknown_actor_is_ignored() {
        let scheduler = Scheduler::new(0);
        scheduler.wake(ActorId::from_index(42));
    }
}
