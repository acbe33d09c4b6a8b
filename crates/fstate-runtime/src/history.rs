#![forbid(unsafe_code)]

//! Undo and redo over the change stream.
//!
//! Two tools share one mechanism: every [`StateChange`] knows its own
//! structural inverse ([`StateChange::inverse`]) and how to redo itself
//! ([`StateChange::replay`]).
//!
//! - [`undoable`] captures the changes made by one synchronous call and
//!   hands back a one-shot [`Undoable`].
//! - [`History`] records a node continuously into bounded backward and
//!   forward stacks of [`HistoryEntry`] transactions.
//!
//! # Invariants
//!
//! - Undoing an entry applies its inverses in reverse chronological order.
//! - [`Undoable::undo`] succeeds at most once; later calls are no-ops.
//!   A failed undo keeps the changes it has not reverted, so it can be
//!   retried.
//! - A failed [`History::backward`] or [`History::forward`] leaves the
//!   entry on the stack it came from.
//! - A history never records the changes it applies itself.
//! - A new change after [`History::backward`] discards the forward stack.
//!
//! # Failure Modes
//!
//! - **Stale target**: the node a change happened on was destroyed or
//!   moved away before undo. The entry reports
//!   [`StateError::UnknownNode`] or [`StateError::InvalidKey`] and the
//!   remaining inverses are not applied. A failing change is retried whole.
//! - **State drift**: changes made outside the recorded node can make an
//!   inverse land on a different value than the one it was captured from.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use fstate_core::{
    Container, Engine, Key, Mutate, NodeId, Result, State, StateChange, StateError,
    SubscribeOptions, Subscription, Value,
};
use tracing::{debug, trace};

use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Undoable
// ---------------------------------------------------------------------------

/// Changes captured by [`undoable`], ready to be reverted once.
pub struct Undoable<T> {
    /// Whatever the captured call returned.
    pub result: T,
    engine: Engine,
    entries: Vec<Captured>,
    spent: bool,
}

/// One change and the node it happened on.
struct Captured {
    node: NodeId,
    raw: Option<Container>,
    change: StateChange,
}

impl Captured {
    /// The node by id, or the node now wrapping the same container when the
    /// original was reclaimed and the container linked again.
    fn target(&self, engine: &Engine) -> Result<State> {
        engine
            .node(self.node)
            .or_else(|| {
                let raw = self.raw.clone()?;
                engine.lookup(&Value::Container(raw))
            })
            .ok_or(StateError::UnknownNode(self.node))
    }
}

impl<T: fmt::Debug> fmt::Debug for Undoable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Undoable")
            .field("result", &self.result)
            .field("entries", &self.entries.len())
            .field("spent", &self.spent)
            .finish()
    }
}

/// Run `f`, capturing every change committed while it runs, on any node of
/// `engine`.
///
/// A failure inside `f` does not roll anything back: whatever was applied
/// before the failure stays applied and stays undoable.
pub fn undoable<T>(engine: &Engine, f: impl FnOnce() -> T) -> Undoable<T> {
    let log: Rc<RefCell<Vec<Captured>>> = Rc::default();
    let sink = Rc::clone(&log);
    let source = engine.clone();
    let tap = engine.tap(move |node, change| {
        let raw = source.node(node).map(|state| state.raw().clone());
        sink.borrow_mut().push(Captured {
            node,
            raw,
            change: change.clone(),
        });
    });
    let result = f();
    drop(tap);
    let entries = std::mem::take(&mut *log.borrow_mut());
    trace!(captured = entries.len(), "undoable window closed");
    Undoable {
        result,
        engine: engine.clone(),
        entries,
        spent: false,
    }
}

impl<T> Undoable<T> {
    /// Revert the captured changes. Returns `Ok(false)` when there was
    /// nothing left to undo.
    ///
    /// On error the changes not yet reverted stay captured and the undo is
    /// not spent.
    pub fn undo(&mut self) -> Result<bool> {
        if self.spent {
            return Ok(false);
        }
        if self.entries.is_empty() {
            self.spent = true;
            return Ok(false);
        }
        let total = self.entries.len();
        while let Some(captured) = self.entries.last() {
            let target = captured.target(&self.engine)?;
            for mutation in captured.change.inverse() {
                target.apply(mutation)?;
            }
            self.entries.pop();
        }
        self.spent = true;
        debug!(reverted = total, "undoable reverted");
        Ok(true)
    }

    /// Forget the captured changes; a later [`Undoable::undo`] does nothing.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.spent = true;
    }

    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.spent
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take the call's result, dropping the captured changes.
    pub fn into_result(self) -> T {
        self.result
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Configuration for [`history`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryOptions {
    /// Maximum committed entries kept on the backward stack.
    pub limit: usize,
    /// When set, a change arriving more than this long after the previous
    /// one commits the pending entry first.
    pub debounce: Option<Duration>,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            debounce: None,
        }
    }
}

impl HistoryOptions {
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }
}

/// One undo step: changes in the order they happened, keyed relative to
/// the recorded node.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub changes: Vec<StateChange>,
    /// Scheduler time of the last change in the entry.
    pub recorded_at: Duration,
}

impl HistoryEntry {
    /// Split off the changes from `at` onward into a second entry with the
    /// same timestamp.
    fn split_off(&mut self, at: usize) -> Self {
        Self {
            changes: self.changes.split_off(at),
            recorded_at: self.recorded_at,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Default)]
struct Stacks {
    pending: Vec<StateChange>,
    last_change: Option<Duration>,
    backward: VecDeque<HistoryEntry>,
    forward: Vec<HistoryEntry>,
}

struct Shared {
    options: HistoryOptions,
    scheduler: Scheduler,
    stacks: RefCell<Stacks>,
}

impl Shared {
    fn record(&self, change: &StateChange) {
        let now = self.scheduler.now();
        let mut stacks = self.stacks.borrow_mut();
        if let (Some(window), Some(last)) = (self.options.debounce, stacks.last_change)
            && !stacks.pending.is_empty()
            && now.saturating_sub(last) > window
        {
            commit_pending(&mut stacks, self.options.limit);
        }
        stacks.pending.push(change.clone());
        stacks.last_change = Some(now);
        stacks.forward.clear();
    }
}

fn commit_pending(stacks: &mut Stacks, limit: usize) -> bool {
    if stacks.pending.is_empty() {
        return false;
    }
    let entry = HistoryEntry {
        changes: std::mem::take(&mut stacks.pending),
        recorded_at: stacks.last_change.unwrap_or_default(),
    };
    stacks.backward.push_back(entry);
    while stacks.backward.len() > limit {
        stacks.backward.pop_front();
    }
    true
}

/// Continuous undo/redo recorder for one node and everything below it.
pub struct History {
    root: State,
    origin: NodeId,
    shared: Rc<Shared>,
    subscription: Option<Subscription>,
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stacks = self.shared.stacks.borrow();
        f.debug_struct("History")
            .field("root", &self.root.id())
            .field("pending", &stacks.pending.len())
            .field("backward", &stacks.backward.len())
            .field("forward", &stacks.forward.len())
            .finish()
    }
}

/// Start recording `state` with the current scheduler's clock.
#[must_use]
pub fn history(state: &State, options: HistoryOptions) -> History {
    History::new(state, options, &Scheduler::current())
}

impl History {
    #[must_use]
    pub fn new(state: &State, options: HistoryOptions, scheduler: &Scheduler) -> Self {
        let origin = state.engine().new_origin();
        let shared = Rc::new(Shared {
            options,
            scheduler: scheduler.clone(),
            stacks: RefCell::default(),
        });
        let weak: Weak<Shared> = Rc::downgrade(&shared);
        let subscription = state.subscribe_with(
            Rc::new(move |change: &StateChange| {
                if let Some(shared) = weak.upgrade() {
                    shared.record(change);
                }
            }),
            SubscribeOptions::quiet().receiver(origin),
        );
        Self {
            root: state.clone(),
            origin,
            shared,
            subscription: Some(subscription),
        }
    }

    #[must_use]
    pub fn root(&self) -> &State {
        &self.root
    }

    #[must_use]
    pub fn options(&self) -> HistoryOptions {
        self.shared.options
    }

    /// Changes recorded since the last commit.
    #[must_use]
    pub fn changes(&self) -> Vec<StateChange> {
        self.shared.stacks.borrow().pending.clone()
    }

    /// Close the pending changes into one backward entry.
    pub fn commit(&self) -> bool {
        let mut stacks = self.shared.stacks.borrow_mut();
        commit_pending(&mut stacks, self.shared.options.limit)
    }

    #[must_use]
    pub fn can_backward(&self) -> bool {
        let stacks = self.shared.stacks.borrow();
        !stacks.pending.is_empty() || !stacks.backward.is_empty()
    }

    #[must_use]
    pub fn can_forward(&self) -> bool {
        let stacks = self.shared.stacks.borrow();
        stacks.pending.is_empty() && !stacks.forward.is_empty()
    }

    #[must_use]
    pub fn backward_len(&self) -> usize {
        self.shared.stacks.borrow().backward.len()
    }

    #[must_use]
    pub fn forward_len(&self) -> usize {
        self.shared.stacks.borrow().forward.len()
    }

    /// Undo the newest entry, committing pending changes first.
    ///
    /// On error the changes already reverted move to the forward stack and
    /// the rest stay on the backward stack.
    pub fn backward(&self) -> Result<bool> {
        let entry = {
            let mut stacks = self.shared.stacks.borrow_mut();
            commit_pending(&mut stacks, self.shared.options.limit);
            stacks.backward.pop_back()
        };
        let Some(mut entry) = entry else {
            return Ok(false);
        };
        let outcome = self.apply_all(entry.changes.iter().rev(), StateChange::inverse);
        if let Err((reverted, err)) = outcome {
            let done = entry.split_off(entry.len() - reverted);
            let mut stacks = self.shared.stacks.borrow_mut();
            stacks.backward.push_back(entry);
            if !done.is_empty() {
                stacks.forward.push(done);
            }
            return Err(err);
        }
        trace!(changes = entry.len(), "history backward");
        self.shared.stacks.borrow_mut().forward.push(entry);
        Ok(true)
    }

    /// Redo the entry most recently undone.
    ///
    /// On error the changes already redone move to the backward stack and
    /// the rest stay on the forward stack.
    pub fn forward(&self) -> Result<bool> {
        let entry = {
            let mut stacks = self.shared.stacks.borrow_mut();
            if !stacks.pending.is_empty() {
                return Ok(false);
            }
            stacks.forward.pop()
        };
        let Some(mut entry) = entry else {
            return Ok(false);
        };
        if let Err((redone, err)) = self.apply_all(entry.changes.iter(), StateChange::replay) {
            let rest = entry.split_off(redone);
            let mut stacks = self.shared.stacks.borrow_mut();
            if !entry.is_empty() {
                stacks.backward.push_back(entry);
            }
            stacks.forward.push(rest);
            return Err(err);
        }
        trace!(changes = entry.len(), "history forward");
        self.shared.stacks.borrow_mut().backward.push_back(entry);
        Ok(true)
    }

    /// Apply `plan` for each change in turn. On error, also reports how
    /// many changes were fully applied first.
    fn apply_all<'a>(
        &self,
        changes: impl Iterator<Item = &'a StateChange>,
        plan: impl Fn(&StateChange) -> Vec<fstate_core::Mutation>,
    ) -> std::result::Result<(), (usize, StateError)> {
        let engine = self.root.engine().clone();
        engine.emit_as(self.origin, || {
            for (applied, change) in changes.enumerate() {
                let target =
                    resolve(&self.root, change.origin_path()).map_err(|err| (applied, err))?;
                for mutation in plan(change) {
                    target.apply(mutation).map_err(|err| (applied, err))?;
                }
            }
            Ok(())
        })
    }

    /// Drop every pending and committed entry.
    pub fn clear(&self) {
        *self.shared.stacks.borrow_mut() = Stacks::default();
    }

    /// Stop recording. The stacks are kept until the history drops.
    pub fn destroy(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.subscription.as_ref().is_some_and(Subscription::is_active)
    }
}

impl Drop for History {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Walk `path` down from `root` to the node a change happened on.
pub(crate) fn resolve(root: &State, path: &[Key]) -> Result<State> {
    if !root.is_alive() {
        return Err(StateError::UnknownNode(root.id()));
    }
    let mut node = root.clone();
    for key in path {
        node = node
            .child(key.clone())
            .ok_or_else(|| StateError::InvalidKey {
                key: key.to_string(),
            })?;
    }
    Ok(node)
}
