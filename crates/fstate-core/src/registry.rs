#![forbid(unsafe_code)]

//! Node registry: the bidirectional raw-container / node association plus
//! the parent links that give every node a bubbling path.
//!
//! The registry never keeps a raw container alive. Entries hold a weak
//! handle, and [`Registry::lookup`] treats an entry whose container has been
//! dropped as absent. Wrapped [`State`](crate::State) handles carry the
//! strong reference.
//!
//! # Ownership model
//!
//! A node may be referenced from several slots across several parents. Each
//! parent holding it is a *holder*, counted per slot. The node's `parent`
//! link points at the most recently attached holder; it is re-pointed at a surviving holder when
//! the current one goes away. Destroying a parent only cascades to children
//! that end up with no holder at all.

use std::fmt;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use bitflags::bitflags;

use crate::error::RegistryError;
use crate::schema::Schema;
use crate::value::{Container, Key, RawId, WeakContainer};

/// Unique identifier for a wrapped node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-node behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeConfig: u8 {
        /// Link container children so their changes bubble to this node.
        const RECURSIVE = 0b0001;
        /// Wrap a deep copy instead of the caller's container.
        const CLONED    = 0b0010;
        /// Reject invalid mutations instead of reporting and applying them.
        const STRICT    = 0b0100;
        /// Link children lazily, on first read.
        const DEFERRED  = 0b1000;
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::RECURSIVE
    }
}

/// Registry-side metadata for one node.
#[derive(Clone)]
pub struct NodeMeta {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub schema: Option<Rc<dyn Schema>>,
    pub config: NodeConfig,
    /// Bumped once per change originating at or bubbling through the node.
    pub version: u64,
    /// Wrapped directly, not adopted. Losing every holder does not reclaim it.
    pub root: bool,
}

impl NodeMeta {
    #[must_use]
    pub fn new(id: NodeId, config: NodeConfig) -> Self {
        Self {
            id,
            parent: None,
            schema: None,
            config,
            version: 0,
            root: false,
        }
    }
}

impl fmt::Debug for NodeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMeta")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("schema", &self.schema.is_some())
            .field("config", &self.config)
            .field("version", &self.version)
            .field("root", &self.root)
            .finish()
    }
}

/// Where a node currently hangs in its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub parent: NodeId,
    pub key: Key,
}

#[derive(Debug, Clone)]
struct Holder {
    parent: NodeId,
    key: Key,
    slots: usize,
}

struct Entry {
    meta: NodeMeta,
    raw: WeakContainer,
}

/// Arena of node metadata keyed by [`NodeId`], with a reverse index by raw
/// container identity.
#[derive(Default)]
pub struct Registry {
    next_id: u64,
    by_raw: AHashMap<RawId, NodeId>,
    entries: AHashMap<NodeId, Entry>,
    links: AHashMap<NodeId, Link>,
    holders: AHashMap<NodeId, Vec<Holder>>,
    owned: AHashMap<NodeId, AHashSet<NodeId>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.entries.len())
            .field("links", &self.links.len())
            .finish()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh node id.
    pub fn allocate(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    /// Record the association between `raw` and `meta.id`.
    ///
    /// Fails when the raw container already has a live node or the id is
    /// taken. Entries whose container has been dropped are purged first.
    pub fn register(&mut self, raw: &Container, meta: NodeMeta) -> Result<(), RegistryError> {
        let raw_id = raw.raw_id();
        if let Some(existing) = self.by_raw.get(&raw_id).copied() {
            if self.is_live(existing) {
                return Err(RegistryError::AlreadyRegistered(existing));
            }
            self.forget(existing);
        }
        if self.entries.contains_key(&meta.id) {
            return Err(RegistryError::AlreadyRegistered(meta.id));
        }
        self.by_raw.insert(raw_id, meta.id);
        self.entries.insert(
            meta.id,
            Entry {
                meta,
                raw: raw.downgrade(),
            },
        );
        Ok(())
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.raw.is_alive())
    }

    /// Node id for a raw container, if it is registered and alive.
    #[must_use]
    pub fn lookup(&self, raw: &Container) -> Option<NodeId> {
        let id = self.by_raw.get(&raw.raw_id()).copied()?;
        let entry = self.entries.get(&id)?;
        match entry.raw.upgrade() {
            Some(c) if c.ptr_eq(raw) => Some(id),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn meta(&self, id: NodeId) -> Option<&NodeMeta> {
        self.entries.get(&id).map(|e| &e.meta)
    }

    pub fn meta_mut(&mut self, id: NodeId) -> Option<&mut NodeMeta> {
        self.entries.get_mut(&id).map(|e| &mut e.meta)
    }

    /// The raw container for `id`, if it is still alive.
    #[must_use]
    pub fn container(&self, id: NodeId) -> Option<Container> {
        self.entries.get(&id).and_then(|e| e.raw.upgrade())
    }

    /// Drop the association for `id`, returning its metadata.
    pub fn unregister(&mut self, id: NodeId) -> Result<NodeMeta, RegistryError> {
        let entry = self.entries.remove(&id).ok_or(RegistryError::UnknownNode(id))?;
        self.by_raw.retain(|_, v| *v != id);
        self.links.remove(&id);
        self.holders.remove(&id);
        self.owned.remove(&id);
        Ok(entry.meta)
    }

    fn forget(&mut self, id: NodeId) {
        let _ = self.unregister(id);
    }

    /// Point `child`'s bubbling link at `(parent, key)`.
    pub fn link(&mut self, child: NodeId, parent: NodeId, key: Key) {
        self.unlink(child);
        self.links.insert(child, Link { parent, key });
        if let Some(meta) = self.meta_mut(child) {
            meta.parent = Some(parent);
        }
    }

    pub fn unlink(&mut self, child: NodeId) -> Option<Link> {
        if let Some(meta) = self.meta_mut(child) {
            meta.parent = None;
        }
        self.links.remove(&child)
    }

    #[must_use]
    pub fn link_of(&self, child: NodeId) -> Option<&Link> {
        self.links.get(&child)
    }

    /// Record one more slot of `parent` holding `child` (now at `key`), and
    /// make it the bubbling link.
    pub fn attach(&mut self, child: NodeId, parent: NodeId, key: Key) {
        let holders = self.holders.entry(child).or_default();
        match holders.iter().position(|h| h.parent == parent) {
            Some(pos) => {
                let mut h = holders.remove(pos);
                h.slots += 1;
                h.key = key.clone();
                holders.push(h);
            }
            None => holders.push(Holder {
                parent,
                key: key.clone(),
                slots: 1,
            }),
        }
        self.owned.entry(parent).or_default().insert(child);
        self.link(child, parent, key);
    }

    /// Forget one slot of `parent` holding `child`.
    ///
    /// Returns `true` when the child lost its last holder. The bubbling link
    /// moves to a surviving holder when `parent` no longer holds the child.
    pub fn detach(&mut self, child: NodeId, parent: NodeId) -> bool {
        let Some(holders) = self.holders.get_mut(&child) else {
            return true;
        };
        if let Some(pos) = holders.iter().position(|h| h.parent == parent) {
            holders[pos].slots -= 1;
            if holders[pos].slots == 0 {
                holders.remove(pos);
            }
        }
        if holders.iter().any(|h| h.parent == parent) {
            return false;
        }
        if let Some(set) = self.owned.get_mut(&parent) {
            set.remove(&child);
        }
        let fallback = holders.last().map(|h| (h.parent, h.key.clone()));
        let orphaned = holders.is_empty();
        if orphaned {
            self.holders.remove(&child);
        }
        let current = self.links.get(&child).map(|l| l.parent);
        match (current, fallback) {
            (Some(p), _) if p != parent => {}
            (_, Some((p, k))) => self.link(child, p, k),
            (_, None) => {
                self.unlink(child);
            }
        }
        orphaned
    }

    /// Update the remembered slot key after `child` moved inside `parent`.
    pub fn relocate(&mut self, child: NodeId, parent: NodeId, key: Key) {
        if let Some(h) = self
            .holders
            .get_mut(&child)
            .and_then(|hs| hs.iter_mut().find(|h| h.parent == parent))
        {
            h.key = key.clone();
        }
        if let Some(link) = self.links.get_mut(&child) {
            if link.parent == parent {
                link.key = key;
            }
        }
    }

    /// Whether `parent` holds `child` in any slot.
    #[must_use]
    pub fn holds(&self, parent: NodeId, child: NodeId) -> bool {
        self.owned.get(&parent).is_some_and(|s| s.contains(&child))
    }

    /// Parents holding `child`, with the slot key.
    #[must_use]
    pub fn referrers(&self, child: NodeId) -> Vec<Link> {
        self.holders
            .get(&child)
            .map(|hs| {
                hs.iter()
                    .map(|h| Link {
                        parent: h.parent,
                        key: h.key.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `child` is an adopted node that no parent holds any more.
    #[must_use]
    pub fn is_orphan(&self, child: NodeId) -> bool {
        self.meta(child).is_some_and(|meta| !meta.root) && !self.holders.contains_key(&child)
    }

    /// Nodes held by `parent`.
    #[must_use]
    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .owned
            .get(&parent)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// Detach every slot `id` holds and every slot holding `id`.
    ///
    /// Returns the children left without any holder, in id order.
    pub fn release(&mut self, id: NodeId) -> Vec<NodeId> {
        if let Some(holders) = self.holders.remove(&id) {
            for h in holders {
                if let Some(set) = self.owned.get_mut(&h.parent) {
                    set.remove(&id);
                }
            }
        }
        self.unlink(id);

        let mut orphans = Vec::new();
        for child in self.children(id) {
            let Some(holders) = self.holders.get_mut(&child) else {
                continue;
            };
            holders.retain(|h| h.parent != id);
            if let Some(last) = holders.last().map(|h| (h.parent, h.key.clone())) {
                if self.links.get(&child).is_some_and(|l| l.parent == id) {
                    self.link(child, last.0, last.1);
                }
            } else {
                self.holders.remove(&child);
                self.unlink(child);
                orphans.push(child);
            }
        }
        self.owned.remove(&id);
        orphans
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Registered ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop entries whose raw container no longer exists.
    pub fn purge(&mut self) -> usize {
        let dead: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.raw.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.release(*id);
            self.forget(*id);
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ContainerKind;

    fn node(reg: &mut Registry) -> (NodeId, Container) {
        let raw = Container::empty(ContainerKind::Record);
        let id = reg.allocate();
        reg.register(&raw, NodeMeta::new(id, NodeConfig::default())).unwrap();
        (id, raw)
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = Registry::new();
        let (id, raw) = node(&mut reg);
        assert_eq!(reg.lookup(&raw), Some(id));
        assert!(reg.contains(id));
        assert_eq!(reg.meta(id).unwrap().config, NodeConfig::RECURSIVE);
    }

    #[test]
    fn double_register_is_rejected() {
        let mut reg = Registry::new();
        let (id, raw) = node(&mut reg);
        let other = reg.allocate();
        let err = reg.register(&raw, NodeMeta::new(other, NodeConfig::default()));
        assert_eq!(err, Err(RegistryError::AlreadyRegistered(id)));
    }

    #[test]
    fn registry_does_not_retain_containers() {
        let mut reg = Registry::new();
        let (id, raw) = node(&mut reg);
        drop(raw);
        assert!(reg.container(id).is_none());
        assert_eq!(reg.purge(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn unregister_unknown_fails() {
        let mut reg = Registry::new();
        assert_eq!(
            reg.unregister(NodeId::new(42)).map(|m| m.id),
            Err(RegistryError::UnknownNode(NodeId::new(42)))
        );
    }

    #[test]
    fn link_sets_parent() {
        let mut reg = Registry::new();
        let (p, _rp) = node(&mut reg);
        let (c, _rc) = node(&mut reg);
        reg.attach(c, p, Key::from("a"));
        assert_eq!(reg.meta(c).unwrap().parent, Some(p));
        assert_eq!(reg.link_of(c).unwrap().key, Key::from("a"));
        assert!(reg.holds(p, c));
        assert_eq!(reg.children(p), vec![c]);
    }

    #[test]
    fn detach_falls_back_to_other_holder() {
        let mut reg = Registry::new();
        let (p1, _r1) = node(&mut reg);
        let (p2, _r2) = node(&mut reg);
        let (c, _rc) = node(&mut reg);
        reg.attach(c, p1, Key::from("x"));
        reg.attach(c, p2, Key::from("y"));
        assert_eq!(reg.link_of(c).unwrap().parent, p2);
        assert!(!reg.detach(c, p2));
        assert_eq!(reg.link_of(c).unwrap().parent, p1);
        assert_eq!(reg.link_of(c).unwrap().key, Key::from("x"));
        assert!(reg.detach(c, p1));
        assert!(reg.link_of(c).is_none());
    }

    #[test]
    fn release_reports_only_unheld_children() {
        let mut reg = Registry::new();
        let (p1, _r1) = node(&mut reg);
        let (p2, _r2) = node(&mut reg);
        let (solo, _rs) = node(&mut reg);
        let (shared, _rsh) = node(&mut reg);
        reg.attach(solo, p1, Key::from("a"));
        reg.attach(shared, p1, Key::from("b"));
        reg.attach(shared, p2, Key::from("c"));
        let orphans = reg.release(p1);
        assert_eq!(orphans, vec![solo]);
        assert_eq!(reg.link_of(shared).unwrap().parent, p2);
    }

    #[test]
    fn duplicate_slots_are_counted() {
        let mut reg = Registry::new();
        let (p, _rp) = node(&mut reg);
        let (c, _rc) = node(&mut reg);
        reg.attach(c, p, Key::from(0));
        reg.attach(c, p, Key::from(3));
        assert!(!reg.detach(c, p));
        assert!(reg.holds(p, c));
        assert!(reg.detach(c, p));
        assert!(!reg.holds(p, c));
    }

    #[test]
    fn dead_entry_is_replaced_on_register() {
        let mut reg = Registry::new();
        let (first, raw) = node(&mut reg);
        drop(raw);
        let fresh = Container::empty(ContainerKind::List);
        let next = reg.allocate();
        reg.register(&fresh, NodeMeta::new(next, NodeConfig::default())).unwrap();
        assert_eq!(reg.lookup(&fresh), Some(next));
        assert!(reg.container(first).is_none());
    }
}
