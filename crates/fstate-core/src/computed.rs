#![forbid(unsafe_code)]

//! Lazy derived values that re-run when something they read changes.
//!
//! # Design
//!
//! [`Derived<T>`] runs its compute function under [`Engine::track`] and
//! subscribes to exactly the nodes it read. A matching change marks it
//! dirty; the next [`get()`](Derived::get) recomputes and subscribes to the
//! new read set, dropping subscriptions it no longer needs.
//!
//! [`ComputedField<T>`] is the per-node variant: a pure function of one
//! [`State`], memoized against that node's version counter, which moves on
//! every change at or below the node.
//!
//! # Invariants
//!
//! 1. `get()` never returns a value computed before the last matching
//!    change to a dependency.
//! 2. The compute function runs at most once per dirty cycle.
//! 3. `version` increments by exactly 1 per recomputation.
//! 4. A change to a slot that was not read does not dirty the value.
//!
//! # Failure Modes
//!
//! - **Compute function panics**: the previous cached value and
//!   subscriptions are kept and the value stays dirty, so the next `get()`
//!   retries.
//! - **Dependency destroyed**: its subscription goes inert. The value keeps
//!   its cache until invalidated or another dependency changes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::bus::{SubscribeOptions, Subscription};
use crate::change::StateChange;
use crate::engine::Engine;
use crate::registry::NodeId;
use crate::state::State;
use crate::tracker::Dependencies;

struct DerivedInner<T> {
    cached: Option<T>,
    version: u64,
    dependencies: Dependencies,
    subscriptions: Vec<Subscription>,
}

/// A memoized value derived from whatever state its function reads.
///
/// Cloning a `Derived` creates a new handle to the **same** cache.
pub struct Derived<T> {
    engine: Engine,
    compute: Rc<dyn Fn() -> T>,
    dirty: Rc<Cell<bool>>,
    inner: Rc<RefCell<DerivedInner<T>>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            compute: Rc::clone(&self.compute),
            dirty: Rc::clone(&self.dirty),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Derived")
            .field("cached", &inner.cached)
            .field("dirty", &self.dirty.get())
            .field("version", &inner.version)
            .field("dependencies", &inner.dependencies.len())
            .finish()
    }
}

impl<T: 'static> Derived<T> {
    pub(crate) fn new(engine: Engine, compute: impl Fn() -> T + 'static) -> Self {
        Self {
            engine,
            compute: Rc::new(compute),
            dirty: Rc::new(Cell::new(true)),
            inner: Rc::new(RefCell::new(DerivedInner {
                cached: None,
                version: 0,
                dependencies: Dependencies::default(),
                subscriptions: Vec::new(),
            })),
        }
    }

    fn refresh(&self) {
        if !self.dirty.get() && self.inner.borrow().cached.is_some() {
            return;
        }
        let compute = Rc::clone(&self.compute);
        let tracked = self.engine.track(move || compute());
        let subscriptions = self.watch(&tracked.dependencies);
        let stale = {
            let mut inner = self.inner.borrow_mut();
            inner.version += 1;
            inner.dependencies = tracked.dependencies;
            let old_value = inner.cached.replace(tracked.result);
            let old_subs = std::mem::replace(&mut inner.subscriptions, subscriptions);
            (old_value, old_subs)
        };
        self.dirty.set(false);
        drop(stale);
    }

    fn watch(&self, dependencies: &Dependencies) -> Vec<Subscription> {
        dependencies
            .nodes()
            .into_iter()
            .filter(|node| self.engine.contains(*node))
            .map(|node| {
                let dirty = Rc::downgrade(&self.dirty);
                let deps = dependencies.clone();
                self.engine.subscribe_node(
                    node,
                    Rc::new(move |change: &StateChange| {
                        if deps.matches(node, change) {
                            if let Some(dirty) = dirty.upgrade() {
                                dirty.set(true);
                            }
                        }
                    }),
                    SubscribeOptions::quiet(),
                )
            })
            .collect()
    }

    /// Forward this value's reads to an enclosing tracking scope.
    fn propagate_reads(&self) {
        if !self.engine.is_tracking() {
            return;
        }
        let deps = self.inner.borrow().dependencies.clone();
        for dep in &deps {
            self.engine.record_read(dep.node, dep.key.clone());
        }
    }

    /// Access the current value by reference, recomputing first if dirty.
    ///
    /// # Panics
    ///
    /// Panics if `f` calls back into this `Derived` (re-entrant borrow).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.refresh();
        self.propagate_reads();
        let inner = self.inner.borrow();
        match inner.cached.as_ref() {
            Some(value) => f(value),
            None => unreachable!("refresh leaves a cached value"),
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Force the next `get()` to recompute.
    pub fn invalidate(&self) {
        self.dirty.set(true);
    }

    /// Number of recomputations so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    /// Read set of the last computation.
    #[must_use]
    pub fn dependencies(&self) -> Dependencies {
        self.inner.borrow().dependencies.clone()
    }
}

impl<T: Clone + 'static> Derived<T> {
    /// The current value, recomputing if a dependency changed.
    #[must_use]
    pub fn get(&self) -> T {
        self.with(T::clone)
    }
}

/// A pure function of one node, cached per `(node, version)`.
pub struct ComputedField<T> {
    compute: Box<dyn Fn(&State) -> T>,
    cache: RefCell<Option<(NodeId, u64, T)>>,
    runs: Cell<u64>,
}

impl<T: fmt::Debug> fmt::Debug for ComputedField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedField")
            .field("cache", &self.cache.borrow())
            .field("runs", &self.runs.get())
            .finish()
    }
}

impl<T: Clone> ComputedField<T> {
    pub fn new(compute: impl Fn(&State) -> T + 'static) -> Self {
        Self {
            compute: Box::new(compute),
            cache: RefCell::new(None),
            runs: Cell::new(0),
        }
    }

    /// The field's value for `state`.
    pub fn get(&self, state: &State) -> T {
        let id = state.id();
        let version = state.version();
        state.engine().record_read(id, None);
        if let Some((cached_id, cached_version, value)) = &*self.cache.borrow() {
            if *cached_id == id && *cached_version == version {
                return value.clone();
            }
        }
        let value = (self.compute)(state);
        self.runs.set(self.runs.get() + 1);
        let old = self.cache.replace(Some((id, version, value.clone())));
        drop(old);
        value
    }

    /// How many times the function has run.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.get()
    }

    pub fn invalidate(&self) {
        let old = self.cache.take();
        drop(old);
    }
}
