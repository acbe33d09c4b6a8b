#![forbid(unsafe_code)]

//! Explicit per-kind mutation adapter.
//!
//! [`Mutation`] enumerates every write a container accepts. `Data::apply`
//! is the only place mutation semantics live: it performs the write, detects
//! no-ops, and returns an [`Effect`] describing the change plus the
//! container children that entered or left the container.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use crate::change::{ChangeKind, StateChange};
use crate::error::{Result, StateError};
use crate::registry::NodeId;
use crate::value::{Container, ContainerKind, Data, FieldMap, Key, MemberSet, Value};

/// Ordering function for [`Mutation::Sort`].
#[derive(Clone)]
pub struct Comparator(Order);

#[derive(Clone)]
enum Order {
    By(Rc<dyn Fn(&Value, &Value) -> Ordering>),
    /// Already sorted outside the container borrow.
    Settled(Rc<[Value]>),
}

impl Comparator {
    pub fn new(f: impl Fn(&Value, &Value) -> Ordering + 'static) -> Self {
        Self(Order::By(Rc::new(f)))
    }

    /// Sort a copy of `items` now, so the comparator never runs while the
    /// container is borrowed.
    pub(crate) fn settle(&self, items: &[Value]) -> Self {
        let mut sorted = items.to_vec();
        self.sort(&mut sorted);
        Self(Order::Settled(sorted.into()))
    }

    fn sort(&self, items: &mut [Value]) {
        match &self.0 {
            Order::By(f) => items.sort_by(|a, b| f(a, b)),
            Order::Settled(sorted) if sorted.len() == items.len() => {
                items.clone_from_slice(sorted);
            }
            Order::Settled(_) => {}
        }
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comparator(..)")
    }
}

/// One write request against a container.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Assign a field, map key, or list position (`len` appends).
    Set { key: Key, value: Value },
    /// Insert a new slot at `position`; on lists this shifts later items.
    Insert {
        key: Key,
        value: Value,
        position: Option<usize>,
    },
    /// Remove a field, map key, set member, or list position.
    Delete { key: Key },
    Append { items: Vec<Value> },
    RemoveLast,
    InsertFront { items: Vec<Value> },
    RemoveFront,
    /// Replace `delete` items starting at `start`; bounds are clamped.
    Splice {
        start: usize,
        delete: usize,
        items: Vec<Value>,
    },
    /// Reverse the list.
    Reorder,
    Sort { compare: Option<Comparator> },
    Fill {
        value: Value,
        start: usize,
        end: Option<usize>,
    },
    /// Rotate toward the end by `by` positions; negative rotates toward the front.
    Rotate { by: isize },
    /// Add a key-set member.
    Add { key: Key },
    Clear,
    /// Merge entries from a record or map (or members from a set or list).
    Assign { entries: Value },
    Remove { keys: Vec<Key> },
}

impl Mutation {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Set { .. } | Self::Insert { .. } => ChangeKind::Set,
            Self::Delete { .. } => ChangeKind::Delete,
            Self::Append { .. } => ChangeKind::Append,
            Self::RemoveLast => ChangeKind::RemoveLast,
            Self::InsertFront { .. } => ChangeKind::InsertFront,
            Self::RemoveFront => ChangeKind::RemoveFront,
            Self::Splice { .. } => ChangeKind::Splice,
            Self::Reorder => ChangeKind::Reorder,
            Self::Sort { .. } => ChangeKind::Sort,
            Self::Fill { .. } => ChangeKind::Fill,
            Self::Rotate { .. } => ChangeKind::Rotate,
            Self::Add { .. } => ChangeKind::Add,
            Self::Clear => ChangeKind::Clear,
            Self::Assign { .. } => ChangeKind::Assign,
            Self::Remove { .. } => ChangeKind::Remove,
        }
    }

    /// Keys this mutation names explicitly. Whole-container operations name
    /// none.
    #[must_use]
    pub fn target_keys(&self) -> Vec<Key> {
        match self {
            Self::Set { key, .. }
            | Self::Insert { key, .. }
            | Self::Delete { key }
            | Self::Add { key } => vec![key.clone()],
            Self::Remove { keys } => keys.clone(),
            Self::Assign { entries } => entries.as_container().map(Container::keys).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Outcome of one applied mutation, before it becomes a [`StateChange`].
#[derive(Debug)]
pub(crate) struct Effect {
    pub kind: ChangeKind,
    pub keys: Vec<Key>,
    pub value: Option<Value>,
    pub prev: Option<Value>,
    pub position: Option<usize>,
    pub positions: Vec<usize>,
    /// Containers now held by the mutated container, with their slot.
    pub inserted: Vec<(Key, Container)>,
    /// Containers that lost one slot in the mutated container.
    pub removed: Vec<Container>,
}

impl Effect {
    fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            keys: Vec::new(),
            value: None,
            prev: None,
            position: None,
            positions: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
        }
    }

    fn key(mut self, key: Key) -> Self {
        self.keys.push(key);
        self
    }

    fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    fn prev(mut self, prev: Option<Value>) -> Self {
        self.prev = prev;
        self
    }

    fn inserting(mut self, key: Key, value: &Value) -> Self {
        if let Value::Container(c) = value {
            self.inserted.push((key, c.clone()));
        }
        self
    }

    fn removing<'a>(mut self, values: impl IntoIterator<Item = &'a Value>) -> Self {
        self.removed
            .extend(values.into_iter().filter_map(|v| v.as_container().cloned()));
        self
    }

    pub fn into_change(self, emitter: NodeId) -> StateChange {
        StateChange {
            kind: self.kind,
            keys: self.keys,
            value: self.value,
            prev: self.prev,
            emitter: Some(emitter),
            position: self.position,
            positions: self.positions,
        }
    }
}

/// Present keys paired with their current index, ascending, without repeats.
fn positioned(
    keys: impl Iterator<Item = Key>,
    index_of: impl Fn(&Key) -> Option<usize>,
) -> Vec<(usize, Key)> {
    let mut found: Vec<(usize, Key)> = keys.filter_map(|key| index_of(&key).map(|i| (i, key))).collect();
    found.sort_unstable_by_key(|(index, _)| *index);
    found.dedup_by_key(|(index, _)| *index);
    found
}

fn list_value(items: Vec<Value>) -> Value {
    Value::Container(Container::from_data(Data::List(items)))
}

fn index_of(key: &Key) -> Result<usize> {
    key.index().ok_or_else(|| StateError::invalid_key(key))
}

fn clamp(len: usize, start: usize, end: Option<usize>) -> Range<usize> {
    let end = end.unwrap_or(len).min(len);
    start.min(end)..end
}

impl Data {
    /// Apply `mutation`; `Ok(None)` when it leaves the container unchanged.
    pub(crate) fn apply(&mut self, mutation: &Mutation) -> Result<Option<Effect>> {
        let kind = self.kind();
        let mismatch = || StateError::KindMismatch {
            operation: mutation.kind(),
            found: kind,
        };
        let applied = match self {
            Data::Record(fields) => apply_fields(fields, mutation, true),
            Data::Map(fields) => apply_fields(fields, mutation, false),
            Data::List(items) => apply_list(items, mutation),
            Data::Set(members) => apply_set(members, mutation),
        };
        applied.map_err(|e| e.unwrap_or_else(mismatch))
    }
}

/// `Err(None)` signals a kind mismatch, filled in by the caller.
type Applied = std::result::Result<Option<Effect>, Option<StateError>>;

fn apply_fields(fields: &mut FieldMap, mutation: &Mutation, record: bool) -> Applied {
    let norm = |key: &Key| if record { key.to_field() } else { key.clone() };
    let same_kind = |fields: FieldMap| {
        Container::from_data(if record {
            Data::Record(fields)
        } else {
            Data::Map(fields)
        })
    };
    match mutation {
        Mutation::Set { key, value } | Mutation::Insert { key, value, .. } => {
            let key = norm(key);
            if let Some((index, _, slot)) = fields.get_full_mut(&key) {
                if slot == value {
                    return Ok(None);
                }
                let old = std::mem::replace(slot, value.clone());
                return Ok(Some(
                    Effect::new(ChangeKind::Set)
                        .key(key.clone())
                        .at(index)
                        .value(value.clone())
                        .inserting(key, value)
                        .removing([&old])
                        .prev(Some(old)),
                ));
            }
            let position = match mutation {
                Mutation::Insert {
                    position: Some(p), ..
                } => (*p).min(fields.len()),
                _ => fields.len(),
            };
            fields.shift_insert(position, key.clone(), value.clone());
            Ok(Some(
                Effect::new(ChangeKind::Set)
                    .key(key.clone())
                    .at(position)
                    .value(value.clone())
                    .inserting(key, value),
            ))
        }
        Mutation::Delete { key } => {
            let key = norm(key);
            let Some((index, _, old)) = fields.shift_remove_full(&key) else {
                return Ok(None);
            };
            Ok(Some(
                Effect::new(ChangeKind::Delete)
                    .key(key)
                    .at(index)
                    .removing([&old])
                    .prev(Some(old)),
            ))
        }
        Mutation::Clear => {
            if fields.is_empty() {
                return Ok(None);
            }
            let old = std::mem::take(fields);
            let effect = Effect::new(ChangeKind::Clear).removing(old.values());
            Ok(Some(effect.prev(Some(Value::Container(same_kind(old))))))
        }
        Mutation::Assign { entries } => {
            let source = entries.as_container().ok_or(Some(StateError::NotLinkable))?;
            if !matches!(source.kind(), ContainerKind::Record | ContainerKind::Map) {
                return Err(Some(StateError::KindMismatch {
                    operation: ChangeKind::Assign,
                    found: source.kind(),
                }));
            }
            let mut changed = FieldMap::default();
            let mut prev = FieldMap::default();
            let mut effect = Effect::new(ChangeKind::Assign);
            for (key, value) in source.entries() {
                let key = norm(&key);
                let old = fields.insert(key.clone(), value.clone());
                if old.as_ref() == Some(&value) {
                    continue;
                }
                effect = effect.inserting(key.clone(), &value);
                if let Some(old) = old {
                    effect = effect.removing([&old]);
                    prev.insert(key.clone(), old);
                }
                changed.insert(key, value);
            }
            if changed.is_empty() {
                return Ok(None);
            }
            Ok(Some(
                effect
                    .value(Value::Container(same_kind(changed)))
                    .prev(Some(Value::Container(same_kind(prev)))),
            ))
        }
        Mutation::Remove { keys } => {
            let doomed = positioned(keys.iter().map(&norm), |key| fields.get_index_of(key));
            if doomed.is_empty() {
                return Ok(None);
            }
            let mut removed = FieldMap::default();
            for (_, key) in &doomed {
                if let Some(old) = fields.shift_remove(key) {
                    removed.insert(key.clone(), old);
                }
            }
            let mut effect = Effect::new(ChangeKind::Remove).removing(removed.values());
            effect.positions = doomed.into_iter().map(|(index, _)| index).collect();
            Ok(Some(effect.prev(Some(Value::Container(same_kind(removed))))))
        }
        _ => Err(None),
    }
}

fn apply_list(items: &mut Vec<Value>, mutation: &Mutation) -> Applied {
    let len = items.len();
    match mutation {
        Mutation::Set { key, value } => {
            let index = index_of(key)?;
            match index.cmp(&len) {
                Ordering::Less => {
                    if &items[index] == value {
                        return Ok(None);
                    }
                    let old = std::mem::replace(&mut items[index], value.clone());
                    Ok(Some(
                        Effect::new(ChangeKind::Set)
                            .key(Key::from(index))
                            .at(index)
                            .value(value.clone())
                            .inserting(Key::from(index), value)
                            .removing([&old])
                            .prev(Some(old)),
                    ))
                }
                Ordering::Equal => {
                    items.push(value.clone());
                    Ok(Some(
                        Effect::new(ChangeKind::Set)
                            .key(Key::from(index))
                            .at(index)
                            .value(value.clone())
                            .inserting(Key::from(index), value),
                    ))
                }
                Ordering::Greater => Err(Some(StateError::OutOfBounds {
                    position: index,
                    length: len,
                })),
            }
        }
        Mutation::Insert {
            key,
            value,
            position,
        } => {
            let index = match position {
                Some(p) => *p,
                None => index_of(key)?,
            };
            if index > len {
                return Err(Some(StateError::OutOfBounds {
                    position: index,
                    length: len,
                }));
            }
            splice(items, index, 0, vec![value.clone()])
        }
        Mutation::Delete { key } => match key.index() {
            Some(index) if index < len => splice(items, index, 1, Vec::new()),
            Some(_) => Ok(None),
            None => Err(Some(StateError::invalid_key(key))),
        },
        Mutation::Append { items: added } => {
            if added.is_empty() {
                return Ok(None);
            }
            items.extend(added.iter().cloned());
            let mut effect = Effect::new(ChangeKind::Append).key(Key::from(len)).at(len);
            for (offset, v) in added.iter().enumerate() {
                effect = effect.inserting(Key::from(len + offset), v);
            }
            Ok(Some(effect.value(list_value(added.clone()))))
        }
        Mutation::RemoveLast => {
            let Some(old) = items.pop() else {
                return Ok(None);
            };
            Ok(Some(
                Effect::new(ChangeKind::RemoveLast)
                    .key(Key::from(len - 1))
                    .at(len - 1)
                    .removing([&old])
                    .prev(Some(old)),
            ))
        }
        Mutation::InsertFront { items: added } => {
            if added.is_empty() {
                return Ok(None);
            }
            items.splice(0..0, added.iter().cloned());
            let mut effect = Effect::new(ChangeKind::InsertFront).key(Key::from(0usize)).at(0);
            for (offset, v) in added.iter().enumerate() {
                effect = effect.inserting(Key::from(offset), v);
            }
            Ok(Some(effect.value(list_value(added.clone()))))
        }
        Mutation::RemoveFront => {
            if items.is_empty() {
                return Ok(None);
            }
            let old = items.remove(0);
            Ok(Some(
                Effect::new(ChangeKind::RemoveFront)
                    .key(Key::from(0usize))
                    .at(0)
                    .removing([&old])
                    .prev(Some(old)),
            ))
        }
        Mutation::Splice {
            start,
            delete,
            items: added,
        } => {
            let start = (*start).min(len);
            splice(items, start, *delete, added.clone())
        }
        Mutation::Reorder => reorder(items, ChangeKind::Reorder, |items| items.reverse()),
        Mutation::Sort { compare } => reorder(items, ChangeKind::Sort, |items| match compare {
            Some(compare) => compare.sort(items),
            None => items.sort_by(Value::total_cmp),
        }),
        Mutation::Rotate { by } => {
            if len < 2 {
                return Ok(None);
            }
            let steps = by.unsigned_abs() % len;
            let shift = if *by < 0 { (len - steps) % len } else { steps };
            reorder(items, ChangeKind::Rotate, |items| items.rotate_right(shift))
        }
        Mutation::Fill { value, start, end } => {
            let range = clamp(len, *start, *end);
            if range.is_empty() || items[range.clone()].iter().all(|v| v == value) {
                return Ok(None);
            }
            let old: Vec<Value> = items[range.clone()].to_vec();
            let mut effect = Effect::new(ChangeKind::Fill)
                .key(Key::from(range.start))
                .at(range.start)
                .removing(old.iter());
            for index in range.clone() {
                items[index] = value.clone();
                effect = effect.inserting(Key::from(index), value);
            }
            Ok(Some(
                effect
                    .value(list_value(vec![value.clone(); range.len()]))
                    .prev(Some(list_value(old))),
            ))
        }
        Mutation::Clear => {
            if items.is_empty() {
                return Ok(None);
            }
            let old = std::mem::take(items);
            let effect = Effect::new(ChangeKind::Clear).removing(old.iter());
            Ok(Some(effect.prev(Some(list_value(old)))))
        }
        _ => Err(None),
    }
}

fn splice(items: &mut Vec<Value>, start: usize, delete: usize, added: Vec<Value>) -> Applied {
    let end = start.saturating_add(delete).min(items.len());
    if start == end && added.is_empty() {
        return Ok(None);
    }
    let old: Vec<Value> = items.splice(start..end, added.iter().cloned()).collect();
    let mut effect = Effect::new(ChangeKind::Splice)
        .key(Key::from(start))
        .at(start)
        .removing(old.iter());
    for (offset, v) in added.iter().enumerate() {
        effect = effect.inserting(Key::from(start + offset), v);
    }
    Ok(Some(
        effect
            .value(list_value(added))
            .prev(Some(list_value(old))),
    ))
}

fn reorder(items: &mut Vec<Value>, kind: ChangeKind, f: impl FnOnce(&mut Vec<Value>)) -> Applied {
    let old = items.clone();
    f(items);
    if *items == old {
        return Ok(None);
    }
    Ok(Some(
        Effect::new(kind)
            .value(list_value(items.clone()))
            .prev(Some(list_value(old))),
    ))
}

fn member_of(value: &Value) -> std::result::Result<Key, Option<StateError>> {
    value
        .to_key()
        .ok_or_else(|| Some(StateError::invalid_key(format!("{value:?}"))))
}

fn apply_set(members: &mut MemberSet, mutation: &Mutation) -> Applied {
    let set_value = |members: MemberSet| Value::Container(Container::from_data(Data::Set(members)));
    match mutation {
        Mutation::Add { key } | Mutation::Insert { key, position: None, .. } => {
            let (index, added) = members.insert_full(key.clone());
            if !added {
                return Ok(None);
            }
            Ok(Some(
                Effect::new(ChangeKind::Add)
                    .key(key.clone())
                    .at(index)
                    .value(key.to_value()),
            ))
        }
        Mutation::Insert {
            key,
            position: Some(position),
            ..
        } => {
            if members.contains(key) {
                return Ok(None);
            }
            let index = (*position).min(members.len());
            members.shift_insert(index, key.clone());
            Ok(Some(
                Effect::new(ChangeKind::Add)
                    .key(key.clone())
                    .at(index)
                    .value(key.to_value()),
            ))
        }
        Mutation::Delete { key } => {
            let Some((index, member)) = members.shift_remove_full(key) else {
                return Ok(None);
            };
            Ok(Some(
                Effect::new(ChangeKind::Delete)
                    .key(member.clone())
                    .at(index)
                    .prev(Some(member.to_value())),
            ))
        }
        Mutation::Clear => {
            if members.is_empty() {
                return Ok(None);
            }
            let old = std::mem::take(members);
            Ok(Some(Effect::new(ChangeKind::Clear).prev(Some(set_value(old)))))
        }
        Mutation::Assign { entries } => {
            let source = entries.as_container().ok_or(Some(StateError::NotLinkable))?;
            let incoming: Vec<Key> = match source.kind() {
                ContainerKind::Set => source.keys(),
                ContainerKind::List => source
                    .values()
                    .iter()
                    .map(member_of)
                    .collect::<std::result::Result<_, _>>()?,
                found => {
                    return Err(Some(StateError::KindMismatch {
                        operation: ChangeKind::Assign,
                        found,
                    }));
                }
            };
            let added: MemberSet = incoming
                .into_iter()
                .filter(|k| members.insert(k.clone()))
                .collect();
            if added.is_empty() {
                return Ok(None);
            }
            Ok(Some(Effect::new(ChangeKind::Assign).value(set_value(added))))
        }
        Mutation::Remove { keys } => {
            let doomed = positioned(keys.iter().cloned(), |key| members.get_index_of(key));
            if doomed.is_empty() {
                return Ok(None);
            }
            let removed: MemberSet = doomed
                .iter()
                .filter(|(_, key)| members.shift_remove(key))
                .map(|(_, key)| key.clone())
                .collect();
            let mut effect = Effect::new(ChangeKind::Remove);
            effect.positions = doomed.into_iter().map(|(index, _)| index).collect();
            Ok(Some(effect.prev(Some(set_value(removed)))))
        }
        _ => Err(None),
    }
}
