#![forbid(unsafe_code)]

//! The mutation interceptor: [`State`] is the explicit observer wrapper over
//! one container node.
//!
//! Every write goes through a single pipeline:
//!
//! 1. Check the node is alive and read its metadata.
//! 2. With a schema attached, apply the mutation to a shallow copy and
//!    validate it. Strict nodes stop here with [`StateError::Validation`];
//!    others report and continue.
//! 3. Apply the mutation to the real container.
//! 4. Detach removed container children, then link inserted ones.
//! 5. Build the [`StateChange`] with this node (or the active
//!    [`Engine::emit_as`] origin) as emitter.
//! 6. Bump versions and broadcast, bubbling through the link table.
//!
//! Reads go through [`State::get`] and friends, which record dependencies
//! for [`Engine::track`] and link container children on first access.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::rc::Rc;

use crate::bus::{Handler, SubscribeOptions, Subscription};
use crate::change::{ChangeKind, StateChange};
use crate::engine::Engine;
use crate::error::{Result, StateError};
use crate::mutation::{Comparator, Mutation};
use crate::registry::{NodeConfig, NodeId, NodeMeta};
use crate::value::{Container, ContainerKind, Key, Value};

/// Write surface shared by [`State`] and the contract views.
///
/// Only [`Mutate::apply`] is required. Every convenience method routes
/// through it, so a view that guards `apply` guards every entry point.
pub trait Mutate {
    /// Apply one mutation. `Ok(None)` means nothing changed.
    fn apply(&self, mutation: Mutation) -> Result<Option<StateChange>>;

    fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.apply(Mutation::Set {
            key: key.into(),
            value: value.into(),
        })
        .map(drop)
    }

    /// Insert at an ordered position, shifting later list items.
    fn insert(&self, key: impl Into<Key>, value: impl Into<Value>, position: usize) -> Result<()> {
        self.apply(Mutation::Insert {
            key: key.into(),
            value: value.into(),
            position: Some(position),
        })
        .map(drop)
    }

    /// Remove a slot, returning the removed value.
    fn delete(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let change = self.apply(Mutation::Delete { key: key.into() })?;
        Ok(change.and_then(|c| match c.prev {
            Some(Value::Container(removed)) if c.kind == ChangeKind::Splice => {
                removed.values().into_iter().next()
            }
            prev => prev,
        }))
    }

    fn push(&self, value: impl Into<Value>) -> Result<()> {
        self.append([value.into()])
    }

    fn append(&self, items: impl IntoIterator<Item = Value>) -> Result<()> {
        self.apply(Mutation::Append {
            items: items.into_iter().collect(),
        })
        .map(drop)
    }

    fn pop(&self) -> Result<Option<Value>> {
        Ok(self.apply(Mutation::RemoveLast)?.and_then(|c| c.prev))
    }

    fn unshift(&self, value: impl Into<Value>) -> Result<()> {
        self.apply(Mutation::InsertFront {
            items: vec![value.into()],
        })
        .map(drop)
    }

    fn shift(&self) -> Result<Option<Value>> {
        Ok(self.apply(Mutation::RemoveFront)?.and_then(|c| c.prev))
    }

    /// Replace `delete` items at `start`, returning the removed items.
    fn splice(
        &self,
        start: usize,
        delete: usize,
        items: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>> {
        let change = self.apply(Mutation::Splice {
            start,
            delete,
            items: items.into_iter().collect(),
        })?;
        Ok(change
            .and_then(|c| c.prev)
            .and_then(|prev| prev.as_container().map(Container::values))
            .unwrap_or_default())
    }

    fn reverse(&self) -> Result<()> {
        self.apply(Mutation::Reorder).map(drop)
    }

    fn sort(&self) -> Result<()> {
        self.apply(Mutation::Sort { compare: None }).map(drop)
    }

    /// Stable sort by `compare`.
    fn sort_by(&self, compare: impl Fn(&Value, &Value) -> Ordering + 'static) -> Result<()> {
        self.apply(Mutation::Sort {
            compare: Some(Comparator::new(compare)),
        })
        .map(drop)
    }

    fn fill(&self, value: impl Into<Value>, range: impl RangeBounds<usize>) -> Result<()> {
        let start = match range.start_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(e) => Some(e.saturating_add(1)),
            Bound::Excluded(e) => Some(*e),
            Bound::Unbounded => None,
        };
        self.apply(Mutation::Fill {
            value: value.into(),
            start,
            end,
        })
        .map(drop)
    }

    fn rotate(&self, by: isize) -> Result<()> {
        self.apply(Mutation::Rotate { by }).map(drop)
    }

    /// Add a key-set member.
    fn add(&self, member: impl Into<Key>) -> Result<()> {
        self.apply(Mutation::Add { key: member.into() }).map(drop)
    }

    fn clear(&self) -> Result<()> {
        self.apply(Mutation::Clear).map(drop)
    }

    /// Merge entries from a record or map, or members from a set or list.
    fn assign(&self, entries: impl Into<Value>) -> Result<()> {
        self.apply(Mutation::Assign {
            entries: entries.into(),
        })
        .map(drop)
    }

    fn remove<K: Into<Key>>(&self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        self.apply(Mutation::Remove {
            keys: keys.into_iter().map(Into::into).collect(),
        })
        .map(drop)
    }
}

/// Observable handle to one wrapped container.
///
/// Two `State`s are equal when they name the same node of the same engine.
#[derive(Clone)]
pub struct State {
    engine: Engine,
    id: NodeId,
    raw: Container,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.engine == other.engine
    }
}

impl Eq for State {}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("raw", &self.raw)
            .finish()
    }
}

impl State {
    pub(crate) fn new(engine: Engine, id: NodeId, raw: Container) -> Self {
        Self { engine, id, raw }
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The raw container, for untracked reads.
    #[must_use]
    pub fn raw(&self) -> &Container {
        &self.raw
    }

    /// The plain value behind this node.
    #[must_use]
    pub fn value(&self) -> Value {
        Value::Container(self.raw.clone())
    }

    #[must_use]
    pub fn kind(&self) -> ContainerKind {
        self.raw.kind()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.engine.contains(self.id)
    }

    #[must_use]
    pub fn meta(&self) -> Option<NodeMeta> {
        self.engine.meta(self.id)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.meta().map_or(0, |m| m.version)
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.meta().and_then(|m| m.parent)
    }

    fn normalize(&self, key: Key) -> Key {
        if self.raw.kind() == ContainerKind::Record {
            key.to_field()
        } else {
            key
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Read one slot. A container child is linked on first access.
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        let key = self.normalize(key.into());
        self.engine.record_read(self.id, Some(key.clone()));
        let value = self.raw.get(&key)?;
        if let Value::Container(child) = &value {
            self.ensure_child(key, child);
        }
        Some(value)
    }

    /// The wrapped child at `key`, if it is a container.
    pub fn child(&self, key: impl Into<Key>) -> Option<State> {
        let value = self.get(key)?;
        self.engine
            .lookup(&value)
            .or_else(|| self.engine.wrap(&value).ok())
    }

    fn ensure_child(&self, key: Key, child: &Container) {
        let Some(meta) = self.engine.meta(self.id) else {
            return;
        };
        if !meta.config.contains(NodeConfig::RECURSIVE) {
            return;
        }
        let held = {
            let registry = self.engine.registry();
            registry
                .lookup(child)
                .map(|id| registry.holds(self.id, id))
        };
        if held != Some(true) {
            self.engine.adopt(self.id, key, child, meta.config);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.engine.record_read(self.id, None);
        self.raw.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: impl Into<Key>) -> bool {
        let key = self.normalize(key.into());
        self.engine.record_read(self.id, Some(key.clone()));
        self.raw.contains(&key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.engine.record_read(self.id, None);
        self.raw.keys()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.engine.record_read(self.id, None);
        let entries = self.raw.entries();
        for (key, value) in &entries {
            if let Value::Container(child) = value {
                self.ensure_child(key.clone(), child);
            }
        }
        entries
    }

    /// JSON snapshot of the current value.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.engine.record_read(self.id, None);
        self.value().to_json()
    }

    // ── Broadcast ────────────────────────────────────────────────────────

    /// Subscribe with an initial `init` event.
    pub fn subscribe(&self, f: impl Fn(&StateChange) + 'static) -> Subscription {
        self.engine
            .subscribe_node(self.id, Rc::new(f), SubscribeOptions::default())
    }

    pub fn subscribe_with(&self, handler: Handler, options: SubscribeOptions) -> Subscription {
        self.engine.subscribe_node(self.id, handler, options)
    }

    /// Run `f` with changes originating at this node applied but not
    /// broadcast.
    pub fn silently<T>(&self, f: impl FnOnce() -> T) -> T {
        self.engine.mute(self.id, f)
    }

    pub fn on_destroy(&self, hook: impl FnOnce() + 'static) {
        self.engine.on_destroy(self.id, hook);
    }

    pub fn destroy(&self) {
        self.engine.destroy_node(self.id);
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    fn run(&self, mutation: Mutation) -> Result<Option<StateChange>> {
        let meta = self
            .engine
            .meta(self.id)
            .ok_or(StateError::UnknownNode(self.id))?;
        let mutation = match mutation {
            Mutation::Sort {
                compare: Some(compare),
            } => Mutation::Sort {
                compare: Some(compare.settle(&self.raw.values())),
            },
            other => other,
        };
        if let Some(schema) = &meta.schema {
            let candidate = self.raw.shallow_copy();
            let probe = candidate.borrow_mut().apply(&mutation)?;
            if probe.is_none() {
                return Ok(None);
            }
            if let Err(issue) = schema.validate(&Value::Container(candidate)) {
                let strict = meta.config.contains(NodeConfig::STRICT);
                self.engine.validation_failed(Some(self.id), issue, strict)?;
            }
        }
        let effect = self.raw.borrow_mut().apply(&mutation)?;
        let Some(effect) = effect else {
            return Ok(None);
        };
        self.engine
            .relink(self.id, meta.config, &effect.removed, &effect.inserted);
        let emitter = self.engine.current_emitter().unwrap_or(self.id);
        let change = effect.into_change(emitter);
        self.engine.commit(self.id, change.clone());
        Ok(Some(change))
    }
}

impl Mutate for State {
    fn apply(&self, mutation: Mutation) -> Result<Option<StateChange>> {
        self.run(mutation)
    }
}
