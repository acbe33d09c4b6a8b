#![forbid(unsafe_code)]

//! The normalized change event and its structural inverse.
//!
//! Every mutation produces exactly one [`StateChange`]. The event carries
//! enough of the previous state (`prev`, `position`) to build the inverse
//! mutation list used by the history engine, and enough of the new state
//! (`value`) to replay the change on a mirror.
//!
//! # Keys
//!
//! At the originating node `keys` holds at most the mutated slot: the field,
//! map key, set member, or list position. Whole-container operations such as
//! `sort` or `clear` carry no slot. Each bubbling step prepends the child's
//! key in its parent, so a subscriber always sees the path from itself to
//! the slot.

use std::fmt;

use crate::mutation::Mutation;
use crate::registry::NodeId;
use crate::value::{Container, ContainerKind, Key, Value};

/// Closed taxonomy of mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    /// Synthetic event delivered on subscribe.
    Init,
    Set,
    Delete,
    Append,
    RemoveLast,
    InsertFront,
    RemoveFront,
    Splice,
    Reorder,
    Sort,
    Fill,
    Rotate,
    Add,
    Clear,
    Assign,
    Remove,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 16] = [
        Self::Init,
        Self::Set,
        Self::Delete,
        Self::Append,
        Self::RemoveLast,
        Self::InsertFront,
        Self::RemoveFront,
        Self::Splice,
        Self::Reorder,
        Self::Sort,
        Self::Fill,
        Self::Rotate,
        Self::Add,
        Self::Clear,
        Self::Assign,
        Self::Remove,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Append => "append",
            Self::RemoveLast => "remove-last",
            Self::InsertFront => "insert-front",
            Self::RemoveFront => "remove-front",
            Self::Splice => "splice",
            Self::Reorder => "reorder",
            Self::Sort => "sort",
            Self::Fill => "fill",
            Self::Rotate => "rotate",
            Self::Add => "add",
            Self::Clear => "clear",
            Self::Assign => "assign",
            Self::Remove => "remove",
        }
    }

    /// Number of trailing keys naming the slot at the originating node.
    #[must_use]
    pub const fn slot_depth(self) -> usize {
        match self {
            Self::Set
            | Self::Delete
            | Self::Append
            | Self::RemoveLast
            | Self::InsertFront
            | Self::RemoveFront
            | Self::Splice
            | Self::Fill
            | Self::Add => 1,
            _ => 0,
        }
    }

    /// Whether the change touches only the slot it names.
    ///
    /// List operations that shift positions affect every index and are not
    /// key-scoped even though they carry a slot.
    #[must_use]
    pub const fn is_key_scoped(self) -> bool {
        matches!(self, Self::Set | Self::Delete | Self::Add)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One normalized mutation event.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub kind: ChangeKind,
    /// Path from the receiving node to the mutated slot.
    pub keys: Vec<Key>,
    pub value: Option<Value>,
    pub prev: Option<Value>,
    /// Node (or origin token) that produced the change.
    pub emitter: Option<NodeId>,
    /// Ordered position of the slot, when the container is ordered.
    pub position: Option<usize>,
    /// Ascending positions the entries of a `Remove` held before removal,
    /// matching the order of `prev`.
    pub positions: Vec<usize>,
}

impl StateChange {
    #[must_use]
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            keys: Vec::new(),
            value: None,
            prev: None,
            emitter: None,
            position: None,
            positions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.keys.push(key.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_prev(mut self, prev: impl Into<Value>) -> Self {
        self.prev = Some(prev.into());
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    #[must_use]
    pub fn with_emitter(mut self, emitter: NodeId) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// The same event as seen one level up, through `key`.
    #[must_use]
    pub fn prefixed(&self, key: Key) -> Self {
        let mut next = self.clone();
        next.keys.insert(0, key);
        next
    }

    /// Path from the receiving node to the node where the change happened.
    #[must_use]
    pub fn origin_path(&self) -> &[Key] {
        let depth = self.kind.slot_depth().min(self.keys.len());
        &self.keys[..self.keys.len() - depth]
    }

    /// The mutated slot at the originating node, if the kind names one.
    #[must_use]
    pub fn slot(&self) -> Option<&Key> {
        if self.kind.slot_depth() == 1 {
            self.keys.last()
        } else {
            None
        }
    }

    fn slot_or_position(&self) -> Option<Key> {
        self.slot().cloned().or_else(|| self.position.map(Key::from))
    }

    fn start(&self) -> usize {
        self.position
            .or_else(|| self.slot().and_then(Key::index))
            .unwrap_or(0)
    }

    /// Mutations that undo this change when applied to the originating node.
    ///
    /// Applying the list in order restores the previous state. `Init`
    /// inverts to nothing.
    #[must_use]
    pub fn inverse(&self) -> Vec<Mutation> {
        let prev_items = || list_items(self.prev.as_ref());
        let value_len = || list_items(self.value.as_ref()).len();
        match self.kind {
            ChangeKind::Init => Vec::new(),
            ChangeKind::Set => match (self.slot().cloned(), &self.prev) {
                (Some(key), Some(prev)) => vec![Mutation::Set {
                    key,
                    value: prev.clone(),
                }],
                (Some(key), None) => vec![Mutation::Delete { key }],
                _ => Vec::new(),
            },
            ChangeKind::Delete => match self.slot().cloned() {
                Some(key) => vec![Mutation::Insert {
                    key,
                    value: self.prev.clone().unwrap_or_default(),
                    position: self.position,
                }],
                None => Vec::new(),
            },
            ChangeKind::Add => self
                .slot()
                .cloned()
                .map(|key| vec![Mutation::Delete { key }])
                .unwrap_or_default(),
            ChangeKind::Append | ChangeKind::InsertFront => vec![Mutation::Splice {
                start: self.start(),
                delete: value_len(),
                items: Vec::new(),
            }],
            ChangeKind::RemoveLast => vec![Mutation::Append {
                items: self.prev.iter().cloned().collect(),
            }],
            ChangeKind::RemoveFront => vec![Mutation::InsertFront {
                items: self.prev.iter().cloned().collect(),
            }],
            ChangeKind::Splice | ChangeKind::Fill => vec![Mutation::Splice {
                start: self.start(),
                delete: value_len(),
                items: prev_items(),
            }],
            ChangeKind::Reorder | ChangeKind::Sort | ChangeKind::Rotate => {
                let items = prev_items();
                vec![Mutation::Splice {
                    start: 0,
                    delete: items.len(),
                    items,
                }]
            }
            ChangeKind::Clear => match self.prev.as_ref().and_then(Value::as_container) {
                Some(prev) if prev.kind() == ContainerKind::List => vec![Mutation::Append {
                    items: prev.values(),
                }],
                Some(prev) => vec![Mutation::Assign {
                    entries: Value::Container(prev.clone()),
                }],
                None => Vec::new(),
            },
            ChangeKind::Assign => {
                let added = self.value.as_ref().and_then(Value::as_container);
                let prev = self.prev.as_ref().and_then(Value::as_container);
                match (added, prev) {
                    (Some(added), _) if added.kind() == ContainerKind::Set => {
                        vec![Mutation::Remove { keys: added.keys() }]
                    }
                    (Some(added), prev) => {
                        let fresh: Vec<Key> = added
                            .keys()
                            .into_iter()
                            .filter(|k| !prev.is_some_and(|p| p.contains(k)))
                            .collect();
                        let mut out = Vec::new();
                        if !fresh.is_empty() {
                            out.push(Mutation::Remove { keys: fresh });
                        }
                        if let Some(prev) = prev.filter(|p| !p.is_empty()) {
                            out.push(Mutation::Assign {
                                entries: Value::Container(prev.clone()),
                            });
                        }
                        out
                    }
                    (None, _) => Vec::new(),
                }
            }
            ChangeKind::Remove => match self.prev.as_ref().and_then(Value::as_container) {
                Some(prev) if prev.len() == self.positions.len() => {
                    let values = match prev.kind() {
                        ContainerKind::Set => vec![Value::Null; prev.len()],
                        _ => prev.values(),
                    };
                    prev.keys()
                        .into_iter()
                        .zip(values)
                        .zip(self.positions.iter().copied())
                        .map(|((key, value), position)| Mutation::Insert {
                            key,
                            value,
                            position: Some(position),
                        })
                        .collect()
                }
                Some(prev) => vec![Mutation::Assign {
                    entries: Value::Container(prev.clone()),
                }],
                None => Vec::new(),
            },
        }
    }

    /// Mutations that redo this change on an equivalent container.
    #[must_use]
    pub fn replay(&self) -> Vec<Mutation> {
        let value_items = || list_items(self.value.as_ref());
        let prev_len = || list_items(self.prev.as_ref()).len();
        let mutation = match self.kind {
            ChangeKind::Init => return Vec::new(),
            ChangeKind::Set => {
                let Some(key) = self.slot_or_position() else {
                    return Vec::new();
                };
                let value = self.value.clone().unwrap_or_default();
                match (self.prev.is_none(), self.position) {
                    (true, Some(position)) => Mutation::Insert {
                        key,
                        value,
                        position: Some(position),
                    },
                    _ => Mutation::Set { key, value },
                }
            }
            ChangeKind::Delete | ChangeKind::Add => {
                let Some(key) = self.slot().cloned() else {
                    return Vec::new();
                };
                if self.kind == ChangeKind::Add {
                    Mutation::Add { key }
                } else {
                    Mutation::Delete { key }
                }
            }
            ChangeKind::Append => Mutation::Append {
                items: value_items(),
            },
            ChangeKind::InsertFront => Mutation::InsertFront {
                items: value_items(),
            },
            ChangeKind::RemoveLast => Mutation::RemoveLast,
            ChangeKind::RemoveFront => Mutation::RemoveFront,
            ChangeKind::Splice | ChangeKind::Fill => Mutation::Splice {
                start: self.start(),
                delete: prev_len(),
                items: value_items(),
            },
            ChangeKind::Reorder | ChangeKind::Sort | ChangeKind::Rotate => Mutation::Splice {
                start: 0,
                delete: prev_len(),
                items: value_items(),
            },
            ChangeKind::Clear => Mutation::Clear,
            ChangeKind::Assign => Mutation::Assign {
                entries: self.value.clone().unwrap_or_default(),
            },
            ChangeKind::Remove => Mutation::Remove {
                keys: self
                    .prev
                    .as_ref()
                    .and_then(Value::as_container)
                    .map(Container::keys)
                    .unwrap_or_default(),
            },
        };
        vec![mutation]
    }
}

fn list_items(value: Option<&Value>) -> Vec<Value> {
    value
        .and_then(Value::as_container)
        .map(Container::values)
        .unwrap_or_default()
}
