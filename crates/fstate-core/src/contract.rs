#![forbid(unsafe_code)]

//! Read-only and scoped-writable views over a node.
//!
//! A view delegates every read to its node. Writes go through
//! [`Mutate::apply`], where the view decides: a denied mutation reports one
//! [`Diagnostic::ContractViolation`], leaves the node untouched, and returns
//! `Ok(None)`.
//!
//! # Example
//!
//! ```
//! use fstate_core::{AllowList, Engine, Mutate, Value, writable};
//!
//! let engine = Engine::new();
//! let form = engine.wrap(&Value::record([("name", ""), ("id", "u1")])).unwrap();
//! let view = writable(&form, Some(AllowList::keys(["name"])));
//!
//! view.set("name", "Ada").unwrap();
//! view.set("id", "u2").unwrap();
//! assert_eq!(form.get("name"), Some(Value::from("Ada")));
//! assert_eq!(form.get("id"), Some(Value::from("u1")));
//! ```

use std::fmt;

use ahash::AHashSet;

use crate::bus::{Handler, SubscribeOptions, Subscription};
use crate::change::{ChangeKind, StateChange};
use crate::diagnostics::Diagnostic;
use crate::error::Result;
use crate::mutation::Mutation;
use crate::registry::NodeId;
use crate::state::{Mutate, State};
use crate::value::{ContainerKind, Key, Value};

/// Which mutations a [`Writable`] view lets through.
///
/// A mutation is permitted when its operation is listed, or when it names
/// at least one key and every key it names is listed. Keys compare in
/// field form, so `1` and `"1"` are the same entry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    all: bool,
    keys: AHashSet<Key>,
    ops: Vec<ChangeKind>,
}

impl fmt::Debug for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            return f.write_str("AllowList(all)");
        }
        let mut keys: Vec<String> = self.keys.iter().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("AllowList")
            .field("keys", &keys)
            .field("ops", &self.ops)
            .finish()
    }
}

impl AllowList {
    /// Every mutation is permitted.
    #[must_use]
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Nothing is permitted.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keys<K: Into<Key>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| k.into().to_field()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.keys.insert(key.into().to_field());
        self
    }

    #[must_use]
    pub fn with_ops(mut self, ops: impl IntoIterator<Item = ChangeKind>) -> Self {
        for op in ops {
            if !self.ops.contains(&op) {
                self.ops.push(op);
            }
        }
        self
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        self.all
    }

    fn permits_key(&self, key: &Key) -> bool {
        self.all || self.keys.contains(&key.to_field())
    }

    #[must_use]
    pub fn permits(&self, mutation: &Mutation) -> bool {
        if self.all || self.ops.contains(&mutation.kind()) {
            return true;
        }
        let keys = mutation.target_keys();
        !keys.is_empty() && keys.iter().all(|k| self.permits_key(k))
    }

    /// The list a child view at `key` inherits.
    fn descend(&self, key: &Key) -> Self {
        if self.permits_key(key) {
            Self::all()
        } else {
            Self {
                all: false,
                keys: AHashSet::new(),
                ops: self.ops.clone(),
            }
        }
    }
}

fn violation(state: &State, mutation: &Mutation) {
    state.engine().report(Diagnostic::ContractViolation {
        node: state.id(),
        operation: mutation.kind(),
        keys: mutation.target_keys(),
    });
}

macro_rules! delegate_reads {
    ($view:ty) => {
        impl $view {
            #[must_use]
            pub fn id(&self) -> NodeId {
                self.state.id()
            }

            #[must_use]
            pub fn kind(&self) -> ContainerKind {
                self.state.kind()
            }

            #[must_use]
            pub fn version(&self) -> u64 {
                self.state.version()
            }

            /// A detached deep copy of the current value.
            #[must_use]
            pub fn snapshot(&self) -> Value {
                match self.state.value() {
                    Value::Container(raw) => Value::Container(raw.deep_copy()),
                    leaf => leaf,
                }
            }

            pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
                self.state.get(key)
            }

            #[must_use]
            pub fn len(&self) -> usize {
                self.state.len()
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.state.is_empty()
            }

            #[must_use]
            pub fn contains(&self, key: impl Into<Key>) -> bool {
                self.state.contains(key)
            }

            #[must_use]
            pub fn keys(&self) -> Vec<Key> {
                self.state.keys()
            }

            pub fn values(&self) -> Vec<Value> {
                self.state.values()
            }

            pub fn entries(&self) -> Vec<(Key, Value)> {
                self.state.entries()
            }

            #[must_use]
            pub fn to_json(&self) -> serde_json::Value {
                self.state.to_json()
            }

            pub fn subscribe(&self, f: impl Fn(&StateChange) + 'static) -> Subscription {
                self.state.subscribe(f)
            }

            pub fn subscribe_with(
                &self,
                handler: Handler,
                options: SubscribeOptions,
            ) -> Subscription {
                self.state.subscribe_with(handler, options)
            }
        }
    };
}

/// View that rejects every mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadOnly {
    state: State,
}

delegate_reads!(ReadOnly);

impl ReadOnly {
    #[must_use]
    pub fn new(state: &State) -> Self {
        Self {
            state: state.clone(),
        }
    }

    /// Nested containers are read-only too.
    pub fn child(&self, key: impl Into<Key>) -> Option<ReadOnly> {
        self.state.child(key).map(|state| ReadOnly { state })
    }
}

impl Mutate for ReadOnly {
    fn apply(&self, mutation: Mutation) -> Result<Option<StateChange>> {
        violation(&self.state, &mutation);
        Ok(None)
    }
}

/// View that lets through only what its [`AllowList`] permits.
#[derive(Clone, Debug, PartialEq)]
pub struct Writable {
    state: State,
    allow: AllowList,
}

delegate_reads!(Writable);

impl Writable {
    #[must_use]
    pub fn new(state: &State, allow: AllowList) -> Self {
        Self {
            state: state.clone(),
            allow,
        }
    }

    #[must_use]
    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    /// A nested container is fully writable when its key is allowed, and
    /// keeps only the operation allowances otherwise.
    pub fn child(&self, key: impl Into<Key>) -> Option<Writable> {
        let key = key.into();
        let allow = self.allow.descend(&key);
        self.state.child(key).map(|state| Writable { state, allow })
    }

    #[must_use]
    pub fn read_only(&self) -> ReadOnly {
        ReadOnly::new(&self.state)
    }
}

impl Mutate for Writable {
    fn apply(&self, mutation: Mutation) -> Result<Option<StateChange>> {
        if self.allow.permits(&mutation) {
            return self.state.apply(mutation);
        }
        violation(&self.state, &mutation);
        Ok(None)
    }
}

/// Read-only view over `state`.
#[must_use]
pub fn immutable(state: &State) -> ReadOnly {
    ReadOnly::new(state)
}

/// Scoped-writable view over `state`. `None` allows everything.
#[must_use]
pub fn writable(state: &State, allow: Option<AllowList>) -> Writable {
    Writable::new(state, allow.unwrap_or_else(AllowList::all))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::engine::Engine;

    fn collecting(engine: &Engine) -> Rc<RefCell<Vec<Diagnostic>>> {
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reports);
        engine.set_reporter(Rc::new(move |d: &Diagnostic| sink.borrow_mut().push(d.clone())));
        reports
    }

    #[test]
    fn read_only_rejects_every_entry_point() {
        let engine = Engine::new();
        let reports = collecting(&engine);
        let list = engine.wrap(&Value::list([1, 2, 3])).unwrap();
        let view = immutable(&list);

        view.push(4).unwrap();
        assert_eq!(view.pop().unwrap(), None);
        view.sort().unwrap();
        view.clear().unwrap();
        view.set(0, 9).unwrap();

        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0), Some(Value::Int(1)));
        assert_eq!(reports.borrow().len(), 5);
        assert_eq!(engine.stats().contract_violations, 5);
    }

    #[test]
    fn read_only_delegates_reads() {
        let engine = Engine::new();
        let node = engine
            .wrap(&Value::record([("a", Value::record([("b", 1)]))]))
            .unwrap();
        let view = immutable(&node);
        assert_eq!(view.keys(), vec![Key::from("a")]);
        let nested = view.child("a").unwrap();
        assert_eq!(nested.get("b"), Some(Value::Int(1)));
        let _ = collecting(&engine);
        nested.set("b", 2).unwrap();
        assert_eq!(node.child("a").unwrap().get("b"), Some(Value::Int(1)));
    }

    #[test]
    fn violation_names_operation_and_keys() {
        let engine = Engine::new();
        let reports = collecting(&engine);
        let node = engine.wrap(&Value::record([("a", 1)])).unwrap();
        immutable(&node).set("a", 2).unwrap();
        let reports = reports.borrow();
        assert_eq!(
            reports[0],
            Diagnostic::ContractViolation {
                node: node.id(),
                operation: ChangeKind::Set,
                keys: vec![Key::from("a")],
            }
        );
    }

    #[test]
    fn allow_list_by_key() {
        let engine = Engine::new();
        let reports = collecting(&engine);
        let node = engine.wrap(&Value::record([("a", 1), ("b", 2)])).unwrap();
        let view = writable(&node, Some(AllowList::keys(["a"])));
        view.set("a", 10).unwrap();
        view.set("b", 20).unwrap();
        view.remove(["a", "b"]).unwrap();
        assert_eq!(node.get("a"), Some(Value::Int(10)));
        assert_eq!(node.get("b"), Some(Value::Int(2)));
        assert_eq!(reports.borrow().len(), 2);
    }

    #[test]
    fn allow_list_by_operation() {
        let engine = Engine::new();
        let _ = collecting(&engine);
        let list = engine.wrap(&Value::list([1])).unwrap();
        let view = writable(&list, Some(AllowList::none().with_ops([ChangeKind::Append])));
        view.push(2).unwrap();
        view.clear().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn default_writable_permits_everything() {
        let engine = Engine::new();
        let node = engine.wrap(&Value::record([("a", 1)])).unwrap();
        let view = writable(&node, None);
        assert!(view.allow_list().is_all());
        view.set("b", 2).unwrap();
        view.clear().unwrap();
        assert!(node.is_empty());
    }

    #[test]
    fn writable_child_inherits_by_key() {
        let engine = Engine::new();
        let _ = collecting(&engine);
        let node = engine
            .wrap(&Value::record([
                ("open", Value::record([("x", 1)])),
                ("closed", Value::record([("x", 1)])),
            ]))
            .unwrap();
        let view = writable(&node, Some(AllowList::keys(["open"])));
        view.child("open").unwrap().set("x", 2).unwrap();
        view.child("closed").unwrap().set("x", 2).unwrap();
        assert_eq!(node.child("open").unwrap().get("x"), Some(Value::Int(2)));
        assert_eq!(node.child("closed").unwrap().get("x"), Some(Value::Int(1)));
    }

    #[test]
    fn numeric_keys_match_field_form() {
        let list = AllowList::keys([1]);
        assert!(list.permits(&Mutation::Set {
            key: Key::from("1"),
            value: Value::Null,
        }));
        assert!(!list.permits(&Mutation::Clear));
    }
}
