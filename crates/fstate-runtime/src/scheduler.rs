#![forbid(unsafe_code)]

//! Cooperative timer queue and the batching primitives built on it.
//!
//! Nothing here spawns threads or runs in the background. A [`Scheduler`]
//! holds deadline-ordered tasks and fires the due ones when the host loop
//! calls [`Scheduler::run_due`]. Tests drive a [`Clock::lab`] scheduler
//! with [`Scheduler::advance`].
//!
//! - [`Microbatch`]: coalesce handlers and flush them once after a delay.
//! - [`Micropush`]: hand out executors where only the latest one runs.
//! - [`Microtask`]: one cancellable delayed callback.
//!
//! # Invariants
//!
//! 1. Timers fire in deadline order; equal deadlines fire in scheduling
//!    order.
//! 2. A cancelled timer never fires.
//! 3. A handler scheduled twice into one microbatch window runs once.
//! 4. One panicking microbatch handler does not stop the others.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{error, trace};
use web_time::Instant;

/// Time source for a [`Scheduler`].
#[derive(Clone)]
pub enum Clock {
    /// Wall-clock time since the scheduler was created.
    Real(Instant),
    /// Manually advanced time.
    Lab(Rc<Cell<Duration>>),
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(_) => f.write_str("Clock::Real"),
            Self::Lab(now) => write!(f, "Clock::Lab({:?})", now.get()),
        }
    }
}

impl Clock {
    #[must_use]
    pub fn real() -> Self {
        Self::Real(Instant::now())
    }

    #[must_use]
    pub fn lab() -> Self {
        Self::Lab(Rc::new(Cell::new(Duration::ZERO)))
    }

    /// Elapsed time since the clock's origin.
    #[must_use]
    pub fn now(&self) -> Duration {
        match self {
            Self::Real(origin) => origin.elapsed(),
            Self::Lab(now) => now.get(),
        }
    }

    /// Move a lab clock forward. Real clocks ignore this.
    pub fn advance(&self, by: Duration) {
        if let Self::Lab(now) = self {
            now.set(now.get().saturating_add(by));
        }
    }

    #[must_use]
    pub fn is_lab(&self) -> bool {
        matches!(self, Self::Lab(_))
    }
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    deadline: Duration,
    seq: u64,
}

impl TimerId {
    #[must_use]
    pub fn deadline(self) -> Duration {
        self.deadline
    }
}

type Task = Box<dyn FnOnce()>;

struct SchedulerInner {
    clock: Clock,
    timers: RefCell<BTreeMap<TimerId, Task>>,
    next_seq: Cell<u64>,
}

/// Deadline-ordered queue of one-shot tasks.
///
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("clock", &self.inner.clock)
            .field("pending", &self.pending())
            .finish()
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_clock(Clock::real())
    }
}

thread_local! {
    static DEFAULT: Scheduler = Scheduler::default();
    static ACTIVE: RefCell<Vec<Scheduler>> = const { RefCell::new(Vec::new()) };
}

/// Restores the previously active scheduler on drop.
#[must_use = "dropping the guard deactivates the scheduler"]
pub struct SchedulerGuard {
    _private: (),
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        let popped = ACTIVE.with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheduler on a lab clock starting at zero.
    #[must_use]
    pub fn lab() -> Self {
        Self::with_clock(Clock::lab())
    }

    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                clock,
                timers: RefCell::new(BTreeMap::new()),
                next_seq: Cell::new(0),
            }),
        }
    }

    /// The active scheduler on this thread: the innermost
    /// [`Scheduler::enter`], else the thread-local default.
    #[must_use]
    pub fn current() -> Self {
        ACTIVE
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(|| DEFAULT.with(Clone::clone))
    }

    /// Make this scheduler [`Scheduler::current`] until the guard drops.
    pub fn enter(&self) -> SchedulerGuard {
        ACTIVE.with(|stack| stack.borrow_mut().push(self.clone()));
        SchedulerGuard { _private: () }
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    /// Run `task` once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        let id = TimerId {
            deadline: self.now().saturating_add(delay),
            seq,
        };
        self.inner.timers.borrow_mut().insert(id, Box::new(task));
        trace!(deadline = ?id.deadline, seq, "timer scheduled");
        id
    }

    /// Remove a pending timer. Returns whether it was still pending.
    pub fn cancel(&self, id: TimerId) -> bool {
        let removed = self.inner.timers.borrow_mut().remove(&id);
        removed.is_some()
    }

    #[must_use]
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.inner.timers.borrow().contains_key(&id)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.timers.borrow().keys().next().map(|id| id.deadline)
    }

    fn pop_due(&self, now: Duration) -> Option<Task> {
        let mut timers = self.inner.timers.borrow_mut();
        let first = *timers.keys().next()?;
        if first.deadline > now {
            return None;
        }
        timers.remove(&first)
    }

    /// Fire every timer whose deadline has passed, including timers
    /// scheduled by those tasks that are already due. Returns the count.
    pub fn run_due(&self) -> usize {
        let now = self.now();
        let mut fired = 0;
        while let Some(task) = self.pop_due(now) {
            task();
            fired += 1;
        }
        fired
    }

    /// Advance a lab clock by `by`, firing timers at their deadlines along
    /// the way. On a real clock this only runs what is already due.
    pub fn advance(&self, by: Duration) -> usize {
        let Clock::Lab(now) = &self.inner.clock else {
            return self.run_due();
        };
        let target = now.get().saturating_add(by);
        let mut fired = 0;
        while let Some(deadline) = self.next_deadline().filter(|d| *d <= target) {
            if deadline > now.get() {
                now.set(deadline);
            }
            fired += self.run_due();
        }
        now.set(target);
        fired
    }

    /// Drop every pending timer without running it.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.inner.timers.borrow_mut());
        drop(dropped);
    }
}

// ---------------------------------------------------------------------------
// Microbatch
// ---------------------------------------------------------------------------

/// Handler accepted by [`Microbatch::schedule`]; identity is the `Rc`.
pub type BatchFn = Rc<dyn Fn()>;

#[derive(Default)]
struct BatchState {
    pending: Vec<BatchFn>,
    timer: Option<TimerId>,
}

/// Collects handlers and runs each once, together, after a delay.
pub struct Microbatch {
    scheduler: Scheduler,
    delay: Duration,
    state: Rc<RefCell<BatchState>>,
}

impl fmt::Debug for Microbatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microbatch")
            .field("delay", &self.delay)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Microbatch {
    #[must_use]
    pub fn new(scheduler: &Scheduler, delay: Duration) -> Self {
        Self {
            scheduler: scheduler.clone(),
            delay,
            state: Rc::new(RefCell::new(BatchState::default())),
        }
    }

    /// Add `handler` to the pending set, arming the flush timer if idle.
    /// A handler already pending is not added twice.
    pub fn schedule(&self, handler: BatchFn) {
        let arm = {
            let mut state = self.state.borrow_mut();
            if state.pending.iter().any(|h| Rc::ptr_eq(h, &handler)) {
                return;
            }
            state.pending.push(handler);
            state.timer.is_none()
        };
        if arm {
            let weak = Rc::downgrade(&self.state);
            let id = self.scheduler.schedule(self.delay, move || flush(&weak));
            self.state.borrow_mut().timer = Some(id);
        }
    }

    /// Cancel the pending flush and forget every pending handler.
    pub fn reset(&self) {
        let (timer, pending) = {
            let mut state = self.state.borrow_mut();
            (state.timer.take(), std::mem::take(&mut state.pending))
        };
        if let Some(id) = timer {
            self.scheduler.cancel(id);
        }
        drop(pending);
    }

    /// Flush now instead of waiting for the timer.
    pub fn flush_now(&self) {
        let timer = self.state.borrow_mut().timer;
        if let Some(id) = timer {
            self.scheduler.cancel(id);
        }
        flush(&Rc::downgrade(&self.state));
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }
}

impl Drop for Microbatch {
    fn drop(&mut self) {
        self.reset();
    }
}

fn flush(state: &Weak<RefCell<BatchState>>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let handlers = {
        let mut state = state.borrow_mut();
        state.timer = None;
        std::mem::take(&mut state.pending)
    };
    trace!(count = handlers.len(), "microbatch flush");
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
            error!("microbatch handler panicked");
        }
    }
}

/// A [`Microbatch`] on the current scheduler.
#[must_use]
pub fn microbatch(delay: Duration) -> Microbatch {
    Microbatch::new(&Scheduler::current(), delay)
}

// ---------------------------------------------------------------------------
// Micropush
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PushState {
    generation: u64,
    handler: Option<Rc<dyn Fn()>>,
}

/// Latest-wins handler slot. Each [`Micropush::push`] supersedes every
/// executor handed out before it.
#[derive(Default)]
pub struct Micropush {
    state: Rc<RefCell<PushState>>,
}

impl fmt::Debug for Micropush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Micropush")
            .field("generation", &state.generation)
            .field("armed", &state.handler.is_some())
            .finish()
    }
}

impl Micropush {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` and return the executor that may run it.
    pub fn push(&self, handler: impl Fn() + 'static) -> Executor {
        let (generation, old) = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            let old = state.handler.replace(Rc::new(handler));
            (state.generation, old)
        };
        drop(old);
        Executor {
            state: Rc::downgrade(&self.state),
            generation,
        }
    }

    /// Invalidate the current handler without running it.
    pub fn clear(&self) {
        let old = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.handler.take()
        };
        drop(old);
    }
}

/// Runs its handler only while no later push or clear happened.
#[derive(Clone)]
pub struct Executor {
    state: Weak<RefCell<PushState>>,
    generation: u64,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("generation", &self.generation)
            .field("current", &self.is_current())
            .finish()
    }
}

impl Executor {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.state.upgrade().is_some_and(|state| {
            let state = state.borrow();
            state.generation == self.generation && state.handler.is_some()
        })
    }

    /// Run the handler if this executor is still current.
    pub fn call(&self) -> bool {
        let handler = self.state.upgrade().and_then(|state| {
            let state = state.borrow();
            (state.generation == self.generation)
                .then(|| state.handler.clone())
                .flatten()
        });
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => {
                trace!(generation = self.generation, "stale executor ignored");
                false
            }
        }
    }
}

/// A fresh [`Micropush`].
#[must_use]
pub fn micropush() -> Micropush {
    Micropush::new()
}

// ---------------------------------------------------------------------------
// Microtask
// ---------------------------------------------------------------------------

/// One delayed callback. Scheduling again replaces the pending one.
pub struct Microtask {
    scheduler: Scheduler,
    delay: Duration,
    timer: Rc<Cell<Option<TimerId>>>,
}

impl fmt::Debug for Microtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microtask")
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Microtask {
    #[must_use]
    pub fn new(scheduler: &Scheduler, delay: Duration) -> Self {
        Self {
            scheduler: scheduler.clone(),
            delay,
            timer: Rc::new(Cell::new(None)),
        }
    }

    pub fn schedule(&self, task: impl FnOnce() + 'static) {
        self.cancel();
        let slot = Rc::downgrade(&self.timer);
        let id = self.scheduler.schedule(self.delay, move || {
            if let Some(slot) = slot.upgrade() {
                slot.set(None);
            }
            task();
        });
        self.timer.set(Some(id));
    }

    /// Cancel the pending callback. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        self.timer
            .take()
            .is_some_and(|id| self.scheduler.cancel(id))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.timer.get().is_some()
    }
}

impl Drop for Microtask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A [`Microtask`] on the current scheduler.
#[must_use]
pub fn microtask(delay: Duration) -> Microtask {
    Microtask::new(&Scheduler::current(), delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let c = Rc::new(Cell::new(0));
        (Rc::clone(&c), c)
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let scheduler = Scheduler::lab();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (delay, tag) in [(30, "c"), (10, "a"), (20, "b"), (10, "a2")] {
            let order = Rc::clone(&order);
            scheduler.schedule(ms(delay), move || order.borrow_mut().push(tag));
        }
        assert_eq!(scheduler.advance(ms(25)), 3);
        assert_eq!(*order.borrow(), ["a", "a2", "b"]);
        assert_eq!(scheduler.now(), ms(25));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let scheduler = Scheduler::lab();
        let (count, seen) = counter();
        let id = scheduler.schedule(ms(5), move || count.set(count.get() + 1));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        scheduler.advance(ms(10));
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn tasks_scheduled_while_running_fire_when_due() {
        let scheduler = Scheduler::lab();
        let (count, seen) = counter();
        let inner = scheduler.clone();
        scheduler.schedule(ms(5), move || {
            let count = Rc::clone(&count);
            inner.schedule(ms(5), move || count.set(count.get() + 1));
        });
        scheduler.advance(ms(7));
        assert_eq!(seen.get(), 0);
        scheduler.advance(ms(3));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn enter_sets_current() {
        let lab = Scheduler::lab();
        {
            let _guard = lab.enter();
            assert_eq!(Scheduler::current(), lab);
        }
        assert_ne!(Scheduler::current(), lab);
    }

    #[test]
    fn microbatch_coalesces_same_handler() {
        let scheduler = Scheduler::lab();
        let batch = Microbatch::new(&scheduler, ms(10));
        let (count, seen) = counter();
        let handler: BatchFn = Rc::new(move || count.set(count.get() + 1));
        batch.schedule(Rc::clone(&handler));
        batch.schedule(Rc::clone(&handler));
        assert_eq!(batch.pending(), 1);
        scheduler.advance(ms(9));
        assert_eq!(seen.get(), 0);
        scheduler.advance(ms(1));
        assert_eq!(seen.get(), 1);
        assert_eq!(batch.pending(), 0);
    }

    fn explode() {
        panic!("handler failure");
    }

    #[test]
    fn microbatch_isolates_panics() {
        let scheduler = Scheduler::lab();
        let batch = Microbatch::new(&scheduler, ms(1));
        let (count, seen) = counter();
        batch.schedule(Rc::new(explode));
        batch.schedule(Rc::new(move || count.set(count.get() + 1)));
        scheduler.advance(ms(1));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn microbatch_reset_cancels_flush() {
        let scheduler = Scheduler::lab();
        let batch = Microbatch::new(&scheduler, ms(5));
        let (count, seen) = counter();
        batch.schedule(Rc::new(move || count.set(count.get() + 1)));
        batch.reset();
        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(ms(10));
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn micropush_only_latest_executor_runs() {
        let push = micropush();
        let (count, seen) = counter();
        let first_count = Rc::clone(&count);
        let first = push.push(move || first_count.set(first_count.get() + 1));
        let second = push.push(move || count.set(count.get() + 10));
        assert!(!first.call());
        assert!(second.call());
        assert!(second.call());
        assert_eq!(seen.get(), 20);
        push.clear();
        assert!(!second.call());
        assert!(!second.is_current());
    }

    #[test]
    fn microtask_replaces_and_cancels() {
        let scheduler = Scheduler::lab();
        let task = Microtask::new(&scheduler, ms(5));
        let (count, seen) = counter();
        let c1 = Rc::clone(&count);
        task.schedule(move || c1.set(c1.get() + 1));
        task.schedule(move || count.set(count.get() + 100));
        assert!(task.is_pending());
        scheduler.advance(ms(5));
        assert_eq!(seen.get(), 100);
        assert!(!task.is_pending());
        task.schedule(|| {});
        assert!(task.cancel());
        assert!(!task.cancel());
    }
}
