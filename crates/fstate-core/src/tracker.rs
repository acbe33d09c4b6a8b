#![forbid(unsafe_code)]

//! Read-dependency tracking for derived computations.
//!
//! The engine keeps a stack of scopes. [`Engine::track`](crate::Engine::track)
//! pushes one, runs the computation, and pops it through a guard, so a
//! panicking computation still restores the stack. Reads through a
//! [`State`](crate::State) record into the innermost scope only.

use std::cell::RefCell;

use ahash::RandomState;
use indexmap::IndexSet;

use crate::change::StateChange;
use crate::registry::NodeId;
use crate::value::Key;

/// One recorded read. `key: None` marks a structural read such as `len`
/// or iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub node: NodeId,
    pub key: Option<Key>,
}

/// Ordered, deduplicated read set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    entries: IndexSet<Dependency, RandomState>,
}

impl Dependencies {
    pub(crate) fn record(&mut self, node: NodeId, key: Option<Key>) {
        self.entries.insert(Dependency { node, key });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.iter()
    }

    #[must_use]
    pub fn contains(&self, node: NodeId, key: Option<&Key>) -> bool {
        self.entries.iter().any(|d| d.node == node && d.key.as_ref() == key)
    }

    /// Distinct nodes read, in first-read order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for dep in &self.entries {
            if !out.contains(&dep.node) {
                out.push(dep.node);
            }
        }
        out
    }

    /// Whether `change`, as delivered to `node`, invalidates a recorded read.
    ///
    /// Bubbled changes are matched by the child key they came through.
    /// Changes at the node itself are matched by slot when the kind is
    /// key-scoped, and invalidate every read of the node otherwise.
    #[must_use]
    pub fn matches(&self, node: NodeId, change: &StateChange) -> bool {
        let bubbled = change.keys.len() > change.kind.slot_depth();
        let scoped = bubbled || change.kind.is_key_scoped();
        let first = change.keys.first();
        self.entries.iter().any(|dep| {
            dep.node == node
                && match (&dep.key, first) {
                    (None, _) | (_, None) => true,
                    (Some(key), Some(first)) => !scoped || key == first,
                }
        })
    }
}

impl<'a> IntoIterator for &'a Dependencies {
    type Item = &'a Dependency;
    type IntoIter = indexmap::set::Iter<'a, Dependency>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Result of a tracked computation.
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    pub result: T,
    pub dependencies: Dependencies,
}

/// Stack of active scopes. `None` entries are untracked regions.
#[derive(Default)]
pub(crate) struct ScopeStack {
    scopes: RefCell<Vec<Option<Dependencies>>>,
}

impl ScopeStack {
    pub fn push(&self, tracking: bool) -> ScopeGuard<'_> {
        let mut scopes = self.scopes.borrow_mut();
        scopes.push(tracking.then(Dependencies::default));
        ScopeGuard {
            stack: self,
            depth: scopes.len(),
            finished: false,
        }
    }

    pub fn record(&self, node: NodeId, key: Option<Key>) {
        if let Some(Some(scope)) = self.scopes.borrow_mut().last_mut() {
            scope.record(node, key);
        }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.scopes.borrow().last(), Some(Some(_)))
    }

    fn pop_to(&self, depth: usize) -> Option<Dependencies> {
        let mut scopes = self.scopes.borrow_mut();
        let mut top = None;
        while scopes.len() >= depth && !scopes.is_empty() {
            top = scopes.pop();
        }
        top.flatten()
    }
}

/// Pops its scope on drop, including during unwinding.
pub(crate) struct ScopeGuard<'a> {
    stack: &'a ScopeStack,
    depth: usize,
    finished: bool,
}

impl ScopeGuard<'_> {
    pub fn finish(mut self) -> Dependencies {
        self.finished = true;
        self.stack.pop_to(self.depth).unwrap_or_default()
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.stack.pop_to(self.depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;

    fn deps(entries: &[(u64, Option<&str>)]) -> Dependencies {
        let mut d = Dependencies::default();
        for (node, key) in entries {
            d.record(NodeId::new(*node), key.map(Key::from));
        }
        d
    }

    #[test]
    fn innermost_scope_records() {
        let stack = ScopeStack::default();
        let outer = stack.push(true);
        stack.record(NodeId::new(1), None);
        let inner = stack.push(true);
        stack.record(NodeId::new(2), None);
        let inner_deps = inner.finish();
        let outer_deps = outer.finish();
        assert_eq!(inner_deps.nodes(), vec![NodeId::new(2)]);
        assert_eq!(outer_deps.nodes(), vec![NodeId::new(1)]);
        assert!(!stack.is_tracking());
    }

    #[test]
    fn untracked_scope_records_nothing() {
        let stack = ScopeStack::default();
        let outer = stack.push(true);
        {
            let _quiet = stack.push(false);
            assert!(!stack.is_tracking());
            stack.record(NodeId::new(1), None);
        }
        assert!(outer.finish().is_empty());
    }

    #[test]
    fn guard_restores_stack_on_panic() {
        let stack = ScopeStack::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = stack.push(true);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!stack.is_tracking());
    }

    #[test]
    fn matches_by_key_for_scoped_changes() {
        let d = deps(&[(1, Some("a"))]);
        let set_a = StateChange::new(ChangeKind::Set).with_key("a");
        let set_b = StateChange::new(ChangeKind::Set).with_key("b");
        assert!(d.matches(NodeId::new(1), &set_a));
        assert!(!d.matches(NodeId::new(1), &set_b));
        assert!(!d.matches(NodeId::new(2), &set_a));
    }

    #[test]
    fn structural_changes_match_every_read() {
        let d = deps(&[(1, Some("0"))]);
        let front = StateChange::new(ChangeKind::RemoveFront).with_key(0usize);
        let clear = StateChange::new(ChangeKind::Clear);
        assert!(d.matches(NodeId::new(1), &front));
        assert!(d.matches(NodeId::new(1), &clear));
    }

    #[test]
    fn bubbled_changes_match_by_child_key() {
        let d = deps(&[(1, Some("a"))]);
        let nested = StateChange::new(ChangeKind::Sort).prefixed(Key::from("a"));
        let other = StateChange::new(ChangeKind::Sort).prefixed(Key::from("z"));
        assert!(d.matches(NodeId::new(1), &nested));
        assert!(!d.matches(NodeId::new(1), &other));
    }
}
