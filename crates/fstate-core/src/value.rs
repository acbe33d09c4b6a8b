#![forbid(unsafe_code)]

//! Plain structured values and the container classifier.
//!
//! A [`Value`] is either an opaque leaf (null, bool, number, string) or a
//! [`Container`]: a shared, identity-bearing record, list, key-set, or
//! key-value map. Containers behave like heap objects in a garbage-collected
//! language: cloning a container value clones the handle, so the same raw
//! container can be reachable from several parents and cycles are
//! representable.
//!
//! Raw containers expose read accessors only. After construction, every
//! mutation goes through a wrapped [`State`](crate::State) so it can be
//! classified and broadcast.
//!
//! # Invariants
//!
//! 1. [`classify`] is total: it never panics and reports leaves as `None`.
//! 2. Container equality is identity (`Rc::ptr_eq`); use [`Value::deep_eq`]
//!    for structural comparison.
//! 3. [`RawId`] is stable for the lifetime of the container allocation.

use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet, RandomState};
use indexmap::{IndexMap, IndexSet};

pub(crate) type FieldMap = IndexMap<Key, Value, RandomState>;
pub(crate) type MemberSet = IndexSet<Key, RandomState>;

// ─── Key ─────────────────────────────────────────────────────────────────────

/// One path segment: a record field, list position, set member, or map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
}

impl Key {
    /// The key as a list position, if it is a non-negative integer.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Int(i) => usize::try_from(*i).ok(),
            _ => None,
        }
    }

    /// The key as a string slice, if it is a string key.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Record fields are always strings; `1` and `"1"` name the same field.
    #[must_use]
    pub(crate) fn to_field(&self) -> Key {
        match self {
            Self::Str(_) => self.clone(),
            other => Self::Str(Rc::from(other.to_string())),
        }
    }

    /// The key as a leaf value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Str(s) => Value::Str(Rc::clone(s)),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Str(Rc::from(s))
    }
}

impl From<Rc<str>> for Key {
    fn from(s: Rc<str>) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

// ─── Classification ──────────────────────────────────────────────────────────

/// Structural kind of a linkable container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// String-keyed fields in insertion order.
    Record,
    /// Ordered, index-addressed elements.
    List,
    /// Unique scalar members in insertion order.
    Set,
    /// Scalar-keyed entries in insertion order.
    Map,
}

impl ContainerKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::List => "list",
            Self::Set => "set",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Report whether `value` is a linkable container and of which kind.
///
/// Leaves, including `Null`, are not linkable.
#[must_use]
pub fn classify(value: &Value) -> Option<ContainerKind> {
    match value {
        Value::Container(c) => c.try_kind(),
        _ => None,
    }
}

// ─── Container ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum Data {
    Record(FieldMap),
    List(Vec<Value>),
    Set(MemberSet),
    Map(FieldMap),
}

impl Data {
    pub(crate) fn empty(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::Record => Self::Record(FieldMap::default()),
            ContainerKind::List => Self::List(Vec::new()),
            ContainerKind::Set => Self::Set(MemberSet::default()),
            ContainerKind::Map => Self::Map(FieldMap::default()),
        }
    }

    pub(crate) fn kind(&self) -> ContainerKind {
        match self {
            Self::Record(_) => ContainerKind::Record,
            Self::List(_) => ContainerKind::List,
            Self::Set(_) => ContainerKind::Set,
            Self::Map(_) => ContainerKind::Map,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Record(f) | Self::Map(f) => f.len(),
            Self::List(items) => items.len(),
            Self::Set(m) => m.len(),
        }
    }

    fn map_values(self, mut f: impl FnMut(Value) -> Value) -> Self {
        match self {
            Self::Record(fields) => Self::Record(fields.into_iter().map(|(k, v)| (k, f(v))).collect()),
            Self::Map(fields) => Self::Map(fields.into_iter().map(|(k, v)| (k, f(v))).collect()),
            Self::List(items) => Self::List(items.into_iter().map(f).collect()),
            Self::Set(m) => Self::Set(m),
        }
    }
}

/// Stable identity of a raw container allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawId(usize);

/// A shared, identity-bearing structured container.
#[derive(Clone)]
pub struct Container {
    inner: Rc<RefCell<Data>>,
}

#[derive(Clone)]
pub(crate) struct WeakContainer {
    inner: Weak<RefCell<Data>>,
}

impl WeakContainer {
    pub(crate) fn upgrade(&self) -> Option<Container> {
        self.inner.upgrade().map(|inner| Container { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl Container {
    pub(crate) fn from_data(data: Data) -> Self {
        Self {
            inner: Rc::new(RefCell::new(data)),
        }
    }

    /// Create an empty container of the given kind.
    #[must_use]
    pub fn empty(kind: ContainerKind) -> Self {
        Self::from_data(Data::empty(kind))
    }

    #[must_use]
    pub fn kind(&self) -> ContainerKind {
        self.inner.borrow().kind()
    }

    fn try_kind(&self) -> Option<ContainerKind> {
        self.inner.try_borrow().ok().map(|d| d.kind())
    }

    #[must_use]
    pub fn raw_id(&self) -> RawId {
        RawId(Rc::as_ptr(&self.inner).cast::<()>() as usize)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Container) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw read without tracking or lazy wrapping.
    ///
    /// Set members read back as their own leaf value.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<Value> {
        match &*self.inner.borrow() {
            Data::Record(fields) => fields.get(&key.to_field()).cloned(),
            Data::Map(fields) => fields.get(key).cloned(),
            Data::List(items) => key.index().and_then(|i| items.get(i).cloned()),
            Data::Set(members) => members.get(key).map(Key::to_value),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        match &*self.inner.borrow() {
            Data::Record(fields) => fields.contains_key(&key.to_field()),
            Data::Map(fields) => fields.contains_key(key),
            Data::List(items) => key.index().is_some_and(|i| i < items.len()),
            Data::Set(members) => members.contains(key),
        }
    }

    /// Keys in order: field names, positions, members, or map keys.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        match &*self.inner.borrow() {
            Data::Record(fields) | Data::Map(fields) => fields.keys().cloned().collect(),
            Data::List(items) => (0..items.len()).map(Key::from).collect(),
            Data::Set(members) => members.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        match &*self.inner.borrow() {
            Data::Record(fields) | Data::Map(fields) => fields.values().cloned().collect(),
            Data::List(items) => items.clone(),
            Data::Set(members) => members.iter().map(Key::to_value).collect(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(Key, Value)> {
        match &*self.inner.borrow() {
            Data::Record(fields) | Data::Map(fields) => {
                fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            Data::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (Key::from(i), v.clone()))
                .collect(),
            Data::Set(members) => members.iter().map(|m| (m.clone(), m.to_value())).collect(),
        }
    }

    /// Entries whose value is itself a container.
    pub(crate) fn child_containers(&self) -> Vec<(Key, Container)> {
        self.entries()
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::Container(c) => Some((k, c)),
                _ => None,
            })
            .collect()
    }

    /// Current slot of `child` inside this container, by identity.
    pub(crate) fn find_child(&self, child: &Container) -> Option<Key> {
        let holds = |v: &Value| matches!(v, Value::Container(c) if c.ptr_eq(child));
        match &*self.inner.borrow() {
            Data::Record(fields) | Data::Map(fields) => {
                fields.iter().find(|(_, v)| holds(v)).map(|(k, _)| k.clone())
            }
            Data::List(items) => items.iter().position(holds).map(Key::from),
            Data::Set(_) => None,
        }
    }

    pub(crate) fn holds_at(&self, key: &Key, child: &Container) -> bool {
        matches!(self.get(key), Some(Value::Container(c)) if c.ptr_eq(child))
    }

    pub(crate) fn borrow(&self) -> Ref<'_, Data> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Data> {
        self.inner.borrow_mut()
    }

    pub(crate) fn downgrade(&self) -> WeakContainer {
        WeakContainer {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// A new container holding the same entries (children shared).
    #[must_use]
    pub fn shallow_copy(&self) -> Container {
        Self::from_data(self.inner.borrow().clone())
    }

    /// A structurally identical graph of fresh containers.
    ///
    /// Shared children stay shared and cycles are preserved in the copy.
    #[must_use]
    pub fn deep_copy(&self) -> Container {
        let mut seen = AHashMap::new();
        self.deep_copy_in(&mut seen)
    }

    fn deep_copy_in(&self, seen: &mut AHashMap<RawId, Container>) -> Container {
        if let Some(done) = seen.get(&self.raw_id()) {
            return done.clone();
        }
        let data = self.inner.borrow().clone();
        let copy = Container::empty(data.kind());
        seen.insert(self.raw_id(), copy.clone());
        let data = data.map_values(|v| match v {
            Value::Container(c) => Value::Container(c.deep_copy_in(seen)),
            leaf => leaf,
        });
        *copy.inner.borrow_mut() = data;
        copy
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Container");
        match self.inner.try_borrow() {
            Ok(data) => s.field("kind", &data.kind()).field("len", &data.len()),
            Err(_) => s.field("kind", &"<borrowed>"),
        };
        s.field("id", &self.raw_id()).finish()
    }
}

// ─── Value ───────────────────────────────────────────────────────────────────

/// A plain structured value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Container(Container),
}

impl Value {
    /// Build a record from `(field, value)` pairs. Non-string keys become
    /// their string form.
    pub fn record<K: Into<Key>, V: Into<Value>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        let fields: FieldMap = entries
            .into_iter()
            .map(|(k, v)| (k.into().to_field(), v.into()))
            .collect();
        Self::Container(Container::from_data(Data::Record(fields)))
    }

    pub fn list<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        Self::Container(Container::from_data(Data::List(
            items.into_iter().map(Into::into).collect(),
        )))
    }

    pub fn set<K: Into<Key>>(members: impl IntoIterator<Item = K>) -> Self {
        Self::Container(Container::from_data(Data::Set(
            members.into_iter().map(Into::into).collect(),
        )))
    }

    pub fn map<K: Into<Key>, V: Into<Value>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self::Container(Container::from_data(Data::Map(
            entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        )))
    }

    #[must_use]
    pub fn kind(&self) -> Option<ContainerKind> {
        classify(self)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_container(&self) -> Option<&Container> {
        match self {
            Self::Container(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a set member or map key, if it is a scalar key type.
    #[must_use]
    pub fn to_key(&self) -> Option<Key> {
        match self {
            Self::Bool(b) => Some(Key::Bool(*b)),
            Self::Int(i) => Some(Key::Int(*i)),
            Self::Str(s) => Some(Key::Str(Rc::clone(s))),
            _ => None,
        }
    }

    /// Structural equality. Cycles compare equal when both sides revisit the
    /// same pair of containers.
    #[must_use]
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut visiting = AHashSet::new();
        deep_eq_in(self, other, &mut visiting)
    }

    /// Total order used by the default list sort: null, bools, numbers,
    /// strings, then containers by identity.
    #[must_use]
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Float(_) => 2,
                Value::Str(_) => 3,
                Value::Container(_) => 4,
            }
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                let a = self.as_f64().unwrap_or_default();
                let b = other.as_f64().unwrap_or_default();
                a.total_cmp(&b)
            }
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Container(a), Self::Container(b)) => a.raw_id().cmp(&b.raw_id()),
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Convert to JSON for persistence adapters.
    ///
    /// Sets become arrays, map keys become strings, and a container already
    /// on the current path (a cycle) is written as `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut path = Vec::new();
        to_json_in(self, &mut path)
    }

    /// Build a value from JSON: objects become records, arrays lists.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .unwrap_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN))),
            serde_json::Value::String(s) => Self::Str(Rc::from(s.as_str())),
            serde_json::Value::Array(items) => Self::list(items.iter().map(Self::from_json)),
            serde_json::Value::Object(fields) => {
                Self::record(fields.iter().map(|(k, v)| (k.as_str(), Self::from_json(v))))
            }
        }
    }
}

fn deep_eq_in(a: &Value, b: &Value, visiting: &mut AHashSet<(RawId, RawId)>) -> bool {
    match (a, b) {
        (Value::Container(x), Value::Container(y)) => {
            if x.ptr_eq(y) || !visiting.insert((x.raw_id(), y.raw_id())) {
                return true;
            }
            let (dx, dy) = (x.borrow(), y.borrow());
            match (&*dx, &*dy) {
                (Data::Record(fx), Data::Record(fy)) | (Data::Map(fx), Data::Map(fy)) => {
                    fx.len() == fy.len()
                        && fx.iter().zip(fy.iter()).all(|((kx, vx), (ky, vy))| {
                            kx == ky && deep_eq_in(vx, vy, visiting)
                        })
                }
                (Data::List(ix), Data::List(iy)) => {
                    ix.len() == iy.len()
                        && ix.iter().zip(iy.iter()).all(|(vx, vy)| deep_eq_in(vx, vy, visiting))
                }
                (Data::Set(mx), Data::Set(my)) => mx.len() == my.len() && mx.iter().eq(my.iter()),
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn to_json_in(value: &Value, path: &mut Vec<RawId>) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(x) => serde_json::Number::from_f64(*x).map_or(Json::Null, Json::Number),
        Value::Str(s) => Json::String(s.to_string()),
        Value::Container(c) => {
            let id = c.raw_id();
            if path.contains(&id) {
                return Json::Null;
            }
            path.push(id);
            let out = match &*c.borrow() {
                Data::Record(fields) | Data::Map(fields) => Json::Object(
                    fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), to_json_in(v, path)))
                        .collect(),
                ),
                Data::List(items) => Json::Array(items.iter().map(|v| to_json_in(v, path)).collect()),
                Data::Set(members) => Json::Array(
                    members
                        .iter()
                        .map(|m| to_json_in(&m.to_value(), path))
                        .collect(),
                ),
            };
            path.pop();
            out
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Container(a), Self::Container(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Container(c) => c.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(Rc::from(s))
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Self::Str(s)
    }
}

impl From<Container> for Value {
    fn from(c: Container) -> Self {
        Self::Container(c)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        k.to_value()
    }
}

impl From<&Value> for Value {
    fn from(v: &Value) -> Self {
        v.clone()
    }
}
