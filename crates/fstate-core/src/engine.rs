#![forbid(unsafe_code)]

//! Engine context: registry, link table, subscriber sets, tracking scopes,
//! capture taps, and the diagnostic sink for one state graph.
//!
//! # Design
//!
//! [`Engine`] is a cheap `Rc` handle. Every [`State`] keeps one, so the
//! context lives as long as any wrapped value does. [`Engine::global`]
//! returns a thread-local default instance for callers that do not thread
//! an engine explicitly.
//!
//! A committed change is delivered to the originating node's subscribers,
//! then bubbles up the link table one parent at a time with the child's key
//! prepended. Bubbling stops at a node already visited (cyclic graphs) or
//! after `max_propagation_depth` hops.
//!
//! # Invariants
//!
//! 1. No `RefCell` borrow is held while user code (handlers, taps, hooks,
//!    schemas) runs.
//! 2. One raw container maps to at most one live node.
//! 3. Detaching removed children happens before adopting inserted ones.
//!
//! # Failure Modes
//!
//! - **Handler panics**: the panic propagates to the mutating caller. The
//!   mutation has already been applied and the publishing counter is
//!   restored by its guard.
//! - **Raw container dropped**: the node's registry entry goes stale and is
//!   treated as absent; [`Engine::purge`] reclaims it.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet};
use tracing::{debug, trace, warn};

use crate::bus::{Handler, SubscribeOptions, Subscriber, SubscriberSet, Subscription};
use crate::change::{ChangeKind, StateChange};
use crate::computed::Derived;
use crate::diagnostics::{Diagnostic, Reporter, tracing_reporter};
use crate::error::{Result, StateError, ValidationError};
use crate::registry::{NodeConfig, NodeId, NodeMeta, Registry};
use crate::schema::{Schema, SchemaIssue};
use crate::state::State;
use crate::tracker::{ScopeStack, Tracked};
use crate::value::{Container, Key, Value};

/// Engine-wide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Flags applied to nodes created by [`Engine::wrap`].
    pub default_node_config: NodeConfig,
    /// Maximum number of parent hops a change bubbles through.
    pub max_propagation_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_node_config: NodeConfig::default(),
            max_propagation_depth: 1024,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_node_config(mut self, config: NodeConfig) -> Self {
        self.default_node_config = config;
        self
    }

    #[must_use]
    pub fn with_max_propagation_depth(mut self, depth: usize) -> Self {
        self.max_propagation_depth = depth.max(1);
        self
    }

    /// Defaults adjusted by the environment.
    ///
    /// `FSTATE_STRICT=1` turns on strict validation and `FSTATE_DEFERRED=1`
    /// turns on lazy child linking for every wrapped node.
    #[must_use]
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
        };
        let mut config = Self::default();
        if flag("FSTATE_STRICT") {
            config.default_node_config.insert(NodeConfig::STRICT);
        }
        if flag("FSTATE_DEFERRED") {
            config.default_node_config.insert(NodeConfig::DEFERRED);
        }
        config
    }
}

/// Per-wrap adjustments to the engine's default node config.
#[derive(Clone, Default)]
pub struct WrapOptions {
    pub on: NodeConfig,
    pub off: NodeConfig,
    pub schema: Option<Rc<dyn Schema>>,
}

impl WrapOptions {
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.on.insert(NodeConfig::STRICT);
        self
    }

    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.on.insert(NodeConfig::DEFERRED);
        self
    }

    #[must_use]
    pub fn cloned(mut self) -> Self {
        self.on.insert(NodeConfig::CLONED);
        self
    }

    /// Do not link container children.
    #[must_use]
    pub fn shallow(mut self) -> Self {
        self.off.insert(NodeConfig::RECURSIVE);
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Some(Rc::new(schema));
        self
    }

    fn resolve(&self, base: NodeConfig) -> NodeConfig {
        (base | self.on) - self.off
    }
}

impl fmt::Debug for WrapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapOptions")
            .field("on", &self.on)
            .field("off", &self.off)
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// Counters exposed by [`Engine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub nodes: usize,
    pub links: usize,
    pub subscribers: usize,
    pub events: u64,
    pub diagnostics: u64,
    pub validation_failures: u64,
    pub contract_violations: u64,
}

/// Observer of every committed change at its originating node.
pub type TapFn = Rc<dyn Fn(NodeId, &StateChange)>;

type Hook = Box<dyn FnOnce()>;

pub(crate) struct EngineInner {
    config: EngineConfig,
    registry: RefCell<Registry>,
    subscribers: RefCell<AHashMap<NodeId, SubscriberSet>>,
    publishing: RefCell<AHashMap<NodeId, usize>>,
    muted: RefCell<AHashMap<NodeId, usize>>,
    emitters: RefCell<Vec<NodeId>>,
    scopes: ScopeStack,
    taps: RefCell<Vec<(u64, TapFn)>>,
    hooks: RefCell<AHashMap<NodeId, Vec<Hook>>>,
    reporter: RefCell<Reporter>,
    next_subscriber: Cell<u64>,
    next_tap: Cell<u64>,
    events: Cell<u64>,
    diagnostics: Cell<u64>,
    validation_failures: Cell<u64>,
    contract_violations: Cell<u64>,
}

impl EngineInner {
    pub(crate) fn remove_subscriber(&self, node: NodeId, id: u64) {
        let removed = {
            let mut subs = self.subscribers.borrow_mut();
            let removed = subs.get_mut(&node).and_then(|set| set.remove(id));
            if subs.get(&node).is_some_and(SubscriberSet::is_empty) {
                subs.remove(&node);
            }
            removed
        };
        drop(removed);
    }

    fn remove_tap(&self, id: u64) {
        let removed = {
            let mut taps = self.taps.borrow_mut();
            taps.iter()
                .position(|(tid, _)| *tid == id)
                .map(|pos| taps.remove(pos))
        };
        drop(removed);
    }
}

fn bump(cell: &Cell<u64>) {
    cell.set(cell.get().saturating_add(1));
}

/// RAII registration of a [`TapFn`]. Dropping it removes the tap.
#[must_use = "dropping a Tap removes it immediately"]
pub struct Tap {
    engine: Weak<EngineInner>,
    id: u64,
}

impl Drop for Tap {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_tap(self.id);
        }
    }
}

impl fmt::Debug for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tap").field("id", &self.id).finish()
    }
}

struct CountGuard<'a> {
    map: &'a RefCell<AHashMap<NodeId, usize>>,
    node: NodeId,
}

impl<'a> CountGuard<'a> {
    fn enter(map: &'a RefCell<AHashMap<NodeId, usize>>, node: NodeId) -> Self {
        *map.borrow_mut().entry(node).or_insert(0) += 1;
        Self { map, node }
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.borrow_mut();
        if let Some(count) = map.get_mut(&self.node) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.node);
            }
        }
    }
}

struct EmitterGuard<'a> {
    stack: &'a RefCell<Vec<NodeId>>,
}

impl Drop for EmitterGuard<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

/// Handle to one engine context.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

thread_local! {
    static GLOBAL: Engine = Engine::with_config(EngineConfig::from_env());
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                config,
                registry: RefCell::new(Registry::new()),
                subscribers: RefCell::default(),
                publishing: RefCell::default(),
                muted: RefCell::default(),
                emitters: RefCell::default(),
                scopes: ScopeStack::default(),
                taps: RefCell::default(),
                hooks: RefCell::default(),
                reporter: RefCell::new(tracing_reporter()),
                next_subscriber: Cell::new(0),
                next_tap: Cell::new(0),
                events: Cell::new(0),
                diagnostics: Cell::new(0),
                validation_failures: Cell::new(0),
                contract_violations: Cell::new(0),
            }),
        }
    }

    /// The thread-local default engine.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.with(Clone::clone)
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.inner.config
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Rc::downgrade(&self.inner)
    }

    // ── Wrapping ─────────────────────────────────────────────────────────

    /// Wrap a container with the engine's default node config.
    pub fn wrap(&self, value: &Value) -> Result<State> {
        self.wrap_with(value, WrapOptions::default())
    }

    /// Wrap a container.
    ///
    /// A container that already has a node resolves to that node and
    /// `options` are ignored, unless `CLONED` asks for a fresh copy. A
    /// schema is checked against the initial value: strict nodes fail with
    /// [`StateError::Validation`], others report and proceed.
    pub fn wrap_with(&self, value: &Value, options: WrapOptions) -> Result<State> {
        let Value::Container(raw) = value else {
            return Err(StateError::NotLinkable);
        };
        let config = options.resolve(self.inner.config.default_node_config);
        let raw = if config.contains(NodeConfig::CLONED) {
            raw.deep_copy()
        } else {
            let existing = self.inner.registry.borrow().lookup(raw);
            if let Some(id) = existing {
                return Ok(State::new(self.clone(), id, raw.clone()));
            }
            raw.clone()
        };
        if let Some(schema) = &options.schema {
            if let Err(issue) = schema.validate(&Value::Container(raw.clone())) {
                self.validation_failed(None, issue, config.contains(NodeConfig::STRICT))?;
            }
        }
        let id = self.register(&raw, config, options.schema)?;
        if config.contains(NodeConfig::RECURSIVE) && !config.contains(NodeConfig::DEFERRED) {
            for (key, child) in raw.child_containers() {
                self.adopt(id, key, &child, config);
            }
        }
        Ok(State::new(self.clone(), id, raw))
    }

    fn register(
        &self,
        raw: &Container,
        config: NodeConfig,
        schema: Option<Rc<dyn Schema>>,
    ) -> Result<NodeId> {
        let registered = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.allocate();
            let mut meta = NodeMeta::new(id, config);
            meta.schema = schema;
            meta.root = true;
            registry.register(raw, meta).map(|()| id)
        };
        match registered {
            Ok(id) => {
                trace!(node = %id, kind = %raw.kind(), "node created");
                Ok(id)
            }
            Err(err) => {
                if let crate::error::RegistryError::AlreadyRegistered(node) = err {
                    self.report(Diagnostic::AlreadyRegistered { node });
                }
                Err(err.into())
            }
        }
    }

    /// Link `child` into `parent[key]`, creating nodes for fresh containers
    /// down to the first already-registered one.
    pub(crate) fn adopt(&self, parent: NodeId, key: Key, child: &Container, config: NodeConfig) {
        let existing = self.inner.registry.borrow().lookup(child);
        if let Some(id) = existing {
            self.inner.registry.borrow_mut().attach(id, parent, key);
            return;
        }
        let config = config - NodeConfig::CLONED;
        let created = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.allocate();
            registry
                .register(child, NodeMeta::new(id, config))
                .map(|()| {
                    registry.attach(id, parent, key);
                    id
                })
        };
        let Ok(id) = created else {
            return;
        };
        trace!(node = %id, parent = %parent, "child node created");
        if !config.contains(NodeConfig::DEFERRED) {
            for (key, grandchild) in child.child_containers() {
                self.adopt(id, key, &grandchild, config);
            }
        }
    }

    /// Detach removed children, adopt inserted ones, then destroy adopted
    /// children left without any holder.
    pub(crate) fn relink(
        &self,
        parent: NodeId,
        config: NodeConfig,
        removed: &[Container],
        inserted: &[(Key, Container)],
    ) {
        if !config.contains(NodeConfig::RECURSIVE) {
            return;
        }
        let mut orphans = Vec::new();
        for child in removed {
            let mut registry = self.inner.registry.borrow_mut();
            if let Some(id) = registry.lookup(child) {
                if registry.detach(id, parent) {
                    orphans.push(id);
                }
            }
        }
        for (key, child) in inserted {
            let existing = self.inner.registry.borrow().lookup(child);
            match existing {
                Some(id) => self.inner.registry.borrow_mut().attach(id, parent, key.clone()),
                None if !config.contains(NodeConfig::DEFERRED) => {
                    self.adopt(parent, key.clone(), child, config);
                }
                None => {}
            }
        }
        orphans.retain(|id| self.inner.registry.borrow().is_orphan(*id));
        for orphan in orphans {
            trace!(node = %orphan, parent = %parent, "unlinked child reclaimed");
            self.destroy_node(orphan);
        }
    }

    /// The wrapped view of `value`, if it already has a node.
    #[must_use]
    pub fn lookup(&self, value: &Value) -> Option<State> {
        let raw = value.as_container()?;
        let id = self.inner.registry.borrow().lookup(raw)?;
        Some(State::new(self.clone(), id, raw.clone()))
    }

    /// The wrapped view of node `id`, if it is alive.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<State> {
        let raw = self.inner.registry.borrow().container(id)?;
        Some(State::new(self.clone(), id, raw))
    }

    /// The plain value behind a wrapped state.
    #[must_use]
    pub fn unwrap(&self, state: &State) -> Value {
        state.value()
    }

    #[must_use]
    pub fn registry(&self) -> Ref<'_, Registry> {
        self.inner.registry.borrow()
    }

    #[must_use]
    pub fn meta(&self, id: NodeId) -> Option<NodeMeta> {
        self.inner.registry.borrow().meta(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.registry.borrow().contains(id)
    }

    /// A fresh identity for [`Engine::emit_as`] and subscriber receivers.
    pub fn new_origin(&self) -> NodeId {
        self.inner.registry.borrow_mut().allocate()
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    /// Subscribe `handler` to node `id`.
    ///
    /// An unknown node reports [`Diagnostic::UnknownNode`] and returns an
    /// inert subscription, as does registering the same handler twice.
    pub fn subscribe_node(
        &self,
        id: NodeId,
        handler: Handler,
        options: SubscribeOptions,
    ) -> Subscription {
        let raw = self.inner.registry.borrow().container(id);
        let Some(raw) = raw else {
            self.report(Diagnostic::UnknownNode { node: id });
            return Subscription::inert();
        };
        let duplicate = self
            .inner
            .subscribers
            .borrow()
            .get(&id)
            .is_some_and(|set| set.contains_handler(&handler));
        if duplicate {
            return Subscription::inert();
        }
        if options.emit_now {
            let init = StateChange::new(ChangeKind::Init)
                .with_value(Value::Container(raw))
                .with_emitter(id);
            handler(&init);
        }
        let sid = self.inner.next_subscriber.get() + 1;
        self.inner.next_subscriber.set(sid);
        self.inner
            .subscribers
            .borrow_mut()
            .entry(id)
            .or_default()
            .push(Subscriber {
                id: sid,
                receiver: options.receiver,
                handler,
                active: Rc::new(Cell::new(true)),
            });
        Subscription::new(self.downgrade(), id, sid)
    }

    /// Run `f` with every mutation inside it emitted as `origin`.
    pub fn emit_as<T>(&self, origin: NodeId, f: impl FnOnce() -> T) -> T {
        self.inner.emitters.borrow_mut().push(origin);
        let _guard = EmitterGuard {
            stack: &self.inner.emitters,
        };
        f()
    }

    #[must_use]
    pub fn current_emitter(&self) -> Option<NodeId> {
        self.inner.emitters.borrow().last().copied()
    }

    /// Whether node `id` is currently delivering a change.
    #[must_use]
    pub fn is_publishing(&self, id: NodeId) -> bool {
        self.inner.publishing.borrow().contains_key(&id)
    }

    pub(crate) fn mute<T>(&self, id: NodeId, f: impl FnOnce() -> T) -> T {
        let _guard = CountGuard::enter(&self.inner.muted, id);
        f()
    }

    /// Observe every committed change at its originating node, before
    /// delivery.
    pub fn tap(&self, f: impl Fn(NodeId, &StateChange) + 'static) -> Tap {
        let id = self.inner.next_tap.get() + 1;
        self.inner.next_tap.set(id);
        self.inner.taps.borrow_mut().push((id, Rc::new(f)));
        Tap {
            engine: self.downgrade(),
            id,
        }
    }

    pub(crate) fn commit(&self, origin: NodeId, change: StateChange) {
        let muted = self.inner.muted.borrow().contains_key(&origin);
        if !muted {
            bump(&self.inner.events);
            let taps: Vec<TapFn> = self
                .inner
                .taps
                .borrow()
                .iter()
                .map(|(_, tap)| Rc::clone(tap))
                .collect();
            for tap in taps {
                tap(origin, &change);
            }
        }

        let max = self.inner.config.max_propagation_depth;
        let mut visited = AHashSet::new();
        let mut node = origin;
        let mut event = change;
        loop {
            if let Some(meta) = self.inner.registry.borrow_mut().meta_mut(node) {
                meta.version += 1;
            }
            if !muted {
                self.deliver(node, &event);
            }
            visited.insert(node);
            if visited.len() > max {
                warn!(origin = %origin, depth = max, "propagation depth exceeded");
                break;
            }
            let Some((parent, key)) = self.resolve_parent(node) else {
                break;
            };
            if visited.contains(&parent) {
                trace!(node = %node, parent = %parent, "cycle reached, bubbling stops");
                break;
            }
            event = event.prefixed(key);
            node = parent;
        }
    }

    /// Current `(parent, key)` of `child`, repairing a stale key.
    fn resolve_parent(&self, child: NodeId) -> Option<(NodeId, Key)> {
        let (link, child_raw, parent_raw) = {
            let registry = self.inner.registry.borrow();
            let link = registry.link_of(child)?.clone();
            let child_raw = registry.container(child)?;
            let parent_raw = registry.container(link.parent)?;
            (link, child_raw, parent_raw)
        };
        if parent_raw.holds_at(&link.key, &child_raw) {
            return Some((link.parent, link.key));
        }
        let key = parent_raw.find_child(&child_raw)?;
        self.inner
            .registry
            .borrow_mut()
            .relocate(child, link.parent, key.clone());
        Some((link.parent, key))
    }

    fn deliver(&self, node: NodeId, change: &StateChange) {
        let subscribers = match self.inner.subscribers.borrow().get(&node) {
            Some(set) => set.snapshot(),
            None => return,
        };
        let _publishing = CountGuard::enter(&self.inner.publishing, node);
        for sub in subscribers {
            if sub.accepts(change) {
                (sub.handler)(change);
            }
        }
    }

    // ── Tracking ─────────────────────────────────────────────────────────

    /// Run `f`, recording every node/key read through a [`State`].
    pub fn track<T>(&self, f: impl FnOnce() -> T) -> Tracked<T> {
        let guard = self.inner.scopes.push(true);
        let result = f();
        let dependencies = guard.finish();
        Tracked {
            result,
            dependencies,
        }
    }

    /// Run `f` without recording reads into the enclosing scope.
    pub fn untracked<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.inner.scopes.push(false);
        f()
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.inner.scopes.is_tracking()
    }

    pub(crate) fn record_read(&self, node: NodeId, key: Option<Key>) {
        self.inner.scopes.record(node, key);
    }

    /// A memoized value recomputed when a value it read changes.
    pub fn derive<T: 'static>(&self, f: impl Fn() -> T + 'static) -> Derived<T> {
        Derived::new(self.clone(), f)
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Register `hook` to run when node `id` is destroyed.
    pub fn on_destroy(&self, id: NodeId, hook: impl FnOnce() + 'static) {
        if !self.contains(id) {
            self.report(Diagnostic::UnknownNode { node: id });
            return;
        }
        self.inner
            .hooks
            .borrow_mut()
            .entry(id)
            .or_default()
            .push(Box::new(hook));
    }

    /// Destroy node `id`: clear its subscribers, remove it from the
    /// registry, run its destroy hooks, and cascade to children no other
    /// node holds.
    pub fn destroy_node(&self, id: NodeId) {
        if !self.contains(id) {
            self.report(Diagnostic::UnknownNode { node: id });
            return;
        }
        let orphans = self.inner.registry.borrow_mut().release(id);
        let subscribers = self.inner.subscribers.borrow_mut().remove(&id);
        if let Some(mut set) = subscribers {
            set.deactivate_all();
        }
        let _ = self.inner.registry.borrow_mut().unregister(id);
        let hooks = self.inner.hooks.borrow_mut().remove(&id).unwrap_or_default();
        for hook in hooks {
            hook();
        }
        debug!(node = %id, orphans = orphans.len(), "node destroyed");
        for orphan in orphans {
            if self.contains(orphan) {
                self.destroy_node(orphan);
            }
        }
    }

    pub fn destroy(&self, state: &State) {
        self.destroy_node(state.id());
    }

    /// Destroy every node and drop every subscriber, tap, and hook.
    ///
    /// Breaks reference cycles between handlers and the engine.
    pub fn teardown(&self) {
        let ids = self.inner.registry.borrow().ids();
        for id in ids {
            if self.contains(id) {
                self.destroy_node(id);
            }
        }
        let subscribers = std::mem::take(&mut *self.inner.subscribers.borrow_mut());
        let taps = std::mem::take(&mut *self.inner.taps.borrow_mut());
        let hooks = std::mem::take(&mut *self.inner.hooks.borrow_mut());
        drop((subscribers, taps, hooks));
        debug!("engine torn down");
    }

    /// Drop registry entries whose raw container no longer exists.
    pub fn purge(&self) -> usize {
        let purged = self.inner.registry.borrow_mut().purge();
        let stale: Vec<NodeId> = {
            let registry = self.inner.registry.borrow();
            self.inner
                .subscribers
                .borrow()
                .keys()
                .filter(|id| !registry.contains(**id))
                .copied()
                .collect()
        };
        let removed: Vec<SubscriberSet> = {
            let mut subs = self.inner.subscribers.borrow_mut();
            stale.iter().filter_map(|id| subs.remove(id)).collect()
        };
        drop(removed);
        purged
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub fn set_reporter(&self, reporter: Reporter) {
        let old = self.inner.reporter.replace(reporter);
        drop(old);
    }

    /// Hand a recoverable condition to the diagnostic sink.
    pub fn report(&self, diagnostic: Diagnostic) {
        bump(&self.inner.diagnostics);
        if matches!(diagnostic, Diagnostic::ContractViolation { .. }) {
            bump(&self.inner.contract_violations);
        }
        let reporter = Rc::clone(&self.inner.reporter.borrow());
        reporter(&diagnostic);
    }

    /// Strict: the error. Otherwise: report and `Ok`.
    pub(crate) fn validation_failed(
        &self,
        node: Option<NodeId>,
        issue: SchemaIssue,
        strict: bool,
    ) -> Result<()> {
        bump(&self.inner.validation_failures);
        if strict {
            return Err(ValidationError { node, issue }.into());
        }
        self.report(Diagnostic::Validation {
            node,
            message: issue.to_string(),
        });
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let registry = self.inner.registry.borrow();
        EngineStats {
            nodes: registry.len(),
            links: registry.link_count(),
            subscribers: self
                .inner
                .subscribers
                .borrow()
                .values()
                .map(SubscriberSet::len)
                .sum(),
            events: self.inner.events.get(),
            diagnostics: self.inner.diagnostics.get(),
            validation_failures: self.inner.validation_failures.get(),
            contract_violations: self.inner.contract_violations.get(),
        }
    }
}
