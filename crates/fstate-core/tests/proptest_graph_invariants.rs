//! Property-based invariant tests for the mutation pipeline.
//!
//! Verifies:
//!
//! 1. A wrapped list tracks a plain `Vec` model under any operation sequence.
//! 2. Every applied change produces exactly one event and one version bump,
//!    and a mutation reported as a no-op leaves the value unchanged.
//! 3. Applying a change's inverse restores the previous value.
//! 4. Linked list children always bubble with their current index.
//! 5. Read-only views never change the underlying value.
//! 6. Record writes through random keys keep the model and one event each.

use std::cell::RefCell;
use std::rc::Rc;

use fstate_core::{
    Engine, Key, Mutate, Mutation, State, StateChange, SubscribeOptions, Subscription, Value,
    immutable,
};
use proptest::prelude::*;

// ── Strategies ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum ListOp {
    Push(i64),
    Pop,
    Unshift(i64),
    Shift,
    Set(usize, i64),
    Delete(usize),
    Splice(usize, usize, Vec<i64>),
    Reverse,
    Sort,
    Rotate(isize),
    Fill(i64, usize, usize),
    Clear,
}

fn list_op() -> impl Strategy<Value = ListOp> {
    prop_oneof![
        (-50i64..50).prop_map(ListOp::Push),
        Just(ListOp::Pop),
        (-50i64..50).prop_map(ListOp::Unshift),
        Just(ListOp::Shift),
        (0usize..12, -50i64..50).prop_map(|(i, v)| ListOp::Set(i, v)),
        (0usize..12).prop_map(ListOp::Delete),
        (0usize..12, 0usize..4, proptest::collection::vec(-50i64..50, 0..4))
            .prop_map(|(s, d, items)| ListOp::Splice(s, d, items)),
        Just(ListOp::Reverse),
        Just(ListOp::Sort),
        (-5isize..5).prop_map(ListOp::Rotate),
        (-5i64..5, 0usize..12, 0usize..12).prop_map(|(v, s, e)| ListOp::Fill(v, s, e)),
        Just(ListOp::Clear),
    ]
}

fn to_mutation(op: &ListOp, len: usize) -> Mutation {
    match op {
        ListOp::Push(v) => Mutation::Append {
            items: vec![Value::Int(*v)],
        },
        ListOp::Pop => Mutation::RemoveLast,
        ListOp::Unshift(v) => Mutation::InsertFront {
            items: vec![Value::Int(*v)],
        },
        ListOp::Shift => Mutation::RemoveFront,
        ListOp::Set(i, v) => Mutation::Set {
            key: Key::from(i % (len + 1)),
            value: Value::Int(*v),
        },
        ListOp::Delete(i) => Mutation::Delete {
            key: Key::from(*i),
        },
        ListOp::Splice(s, d, items) => Mutation::Splice {
            start: *s,
            delete: *d,
            items: items.iter().copied().map(Value::Int).collect(),
        },
        ListOp::Reverse => Mutation::Reorder,
        ListOp::Sort => Mutation::Sort { compare: None },
        ListOp::Rotate(by) => Mutation::Rotate { by: *by },
        ListOp::Fill(v, s, e) => Mutation::Fill {
            value: Value::Int(*v),
            start: *s,
            end: Some(*e),
        },
        ListOp::Clear => Mutation::Clear,
    }
}

/// Reference semantics on a plain vector.
fn apply_model(model: &mut Vec<i64>, op: &ListOp) {
    let len = model.len();
    match op {
        ListOp::Push(v) => model.push(*v),
        ListOp::Pop => {
            model.pop();
        }
        ListOp::Unshift(v) => model.insert(0, *v),
        ListOp::Shift => {
            if !model.is_empty() {
                model.remove(0);
            }
        }
        ListOp::Set(i, v) => {
            let i = i % (len + 1);
            if i == len {
                model.push(*v);
            } else {
                model[i] = *v;
            }
        }
        ListOp::Delete(i) => {
            if *i < len {
                model.remove(*i);
            }
        }
        ListOp::Splice(s, d, items) => {
            let start = (*s).min(len);
            let end = start.saturating_add(*d).min(len);
            model.splice(start..end, items.iter().copied());
        }
        ListOp::Reverse => model.reverse(),
        ListOp::Sort => model.sort(),
        ListOp::Rotate(by) => {
            if len >= 2 {
                model.rotate_right(by.rem_euclid(len as isize) as usize);
            }
        }
        ListOp::Fill(v, s, e) => {
            let end = (*e).min(len);
            let start = (*s).min(end);
            for slot in &mut model[start..end] {
                *slot = *v;
            }
        }
        ListOp::Clear => model.clear(),
    }
}

fn ints(state: &State) -> Vec<i64> {
    state.values().iter().filter_map(Value::as_i64).collect()
}

fn counting(state: &State) -> (Rc<RefCell<Vec<StateChange>>>, Subscription) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let sub = state.subscribe_with(
        Rc::new(move |c: &StateChange| sink.borrow_mut().push(c.clone())),
        SubscribeOptions::quiet(),
    );
    (log, sub)
}

// ═════════════════════════════════════════════════════════════════════════
// 1–2. Model agreement, one event per change
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn list_tracks_vec_model(
        initial in proptest::collection::vec(-50i64..50, 0..8),
        ops in proptest::collection::vec(list_op(), 0..40),
    ) {
        let engine = Engine::new();
        let list = engine.wrap(&Value::list(initial.iter().copied())).unwrap();
        let mut model = initial.clone();
        let (log, _sub) = counting(&list);

        let mut applied = 0usize;
        for op in &ops {
            let before = model.clone();
            let change = list.apply(to_mutation(op, model.len())).unwrap();
            apply_model(&mut model, op);
            prop_assert_eq!(ints(&list), model.clone(), "after {:?}", op);
            if change.is_none() {
                prop_assert_eq!(&before, &model, "silent change on {:?}", op);
            }
            if change.is_some() {
                applied += 1;
            }
        }
        prop_assert_eq!(log.borrow().len(), applied);
        prop_assert_eq!(list.version(), applied as u64);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Inverses restore the previous value
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn list_inverse_restores(
        initial in proptest::collection::vec(-50i64..50, 0..8),
        op in list_op(),
    ) {
        let engine = Engine::new();
        let list = engine.wrap(&Value::list(initial.iter().copied())).unwrap();
        let change = list.apply(to_mutation(&op, initial.len())).unwrap();
        if let Some(change) = change {
            for undo in change.inverse() {
                list.apply(undo).unwrap();
            }
        }
        prop_assert_eq!(ints(&list), initial);
    }

    #[test]
    fn record_inverse_restores(
        entries in proptest::collection::vec(("[a-e]", -9i64..9), 0..5),
        key in "[a-g]",
        value in -9i64..9,
        pick in 0u8..3,
        doomed in proptest::collection::vec("[a-g]", 0..5),
    ) {
        let engine = Engine::new();
        let node = engine.wrap(&Value::record(entries.iter().map(|(k, v)| (k.as_str(), *v)))).unwrap();
        let before = node.value().to_json().to_string();
        let mutation = match pick {
            0 => Mutation::Delete { key: Key::from(key.as_str()) },
            1 => Mutation::Set { key: Key::from(key.as_str()), value: Value::Int(value) },
            _ => Mutation::Remove { keys: doomed.iter().map(|k| Key::from(k.as_str())).collect() },
        };
        if let Some(change) = node.apply(mutation).unwrap() {
            for undo in change.inverse() {
                node.apply(undo).unwrap();
            }
        }
        // Compared as text: JSON object equality ignores key order.
        prop_assert_eq!(node.value().to_json().to_string(), before);
    }

    #[test]
    fn set_remove_inverse_restores_member_order(
        members in proptest::collection::vec("[a-f]", 0..6),
        doomed in proptest::collection::vec("[a-f]", 0..4),
    ) {
        let engine = Engine::new();
        let set = engine.wrap(&Value::set(members.iter().map(String::as_str))).unwrap();
        let before = set.keys();
        let change = set
            .apply(Mutation::Remove { keys: doomed.iter().map(|k| Key::from(k.as_str())).collect() })
            .unwrap();
        if let Some(change) = change {
            for undo in change.inverse() {
                set.apply(undo).unwrap();
            }
        }
        prop_assert_eq!(set.keys(), before);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Children bubble with their current index
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn children_bubble_with_current_index(
        len in 1usize..8,
        ops in proptest::collection::vec(prop_oneof![
            Just(ListOp::Reverse),
            Just(ListOp::Shift),
            (-3isize..3).prop_map(ListOp::Rotate),
            (0usize..4).prop_map(|s| ListOp::Splice(s, 1, Vec::new())),
        ], 0..6),
    ) {
        let engine = Engine::new();
        let items: Vec<Value> = (0..len).map(|i| Value::record([("id", i)])).collect();
        let list = engine.wrap(&Value::list(items)).unwrap();
        let children: Vec<State> = (0..len).map(|i| list.child(i).unwrap()).collect();
        for op in &ops {
            list.apply(to_mutation(op, list.len())).unwrap();
        }
        let (log, _sub) = counting(&list);
        for child in &children {
            let id = child.get("id").and_then(|v| v.as_i64()).unwrap_or(-1);
            child.set("touched", true).unwrap();
            let position = list
                .values()
                .iter()
                .position(|v| v.as_container().is_some_and(|c| c.ptr_eq(child.raw())));
            let delivered = log.borrow_mut().drain(..).collect::<Vec<_>>();
            match position {
                Some(index) => {
                    prop_assert_eq!(delivered.len(), 1, "child {} at {}", id, index);
                    prop_assert_eq!(&delivered[0].keys[0], &Key::from(index));
                }
                None => prop_assert!(delivered.is_empty(), "removed child {} still bubbles", id),
            }
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Read-only views
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn read_only_never_mutates(
        initial in proptest::collection::vec(-50i64..50, 0..8),
        ops in proptest::collection::vec(list_op(), 1..10),
    ) {
        let engine = Engine::new();
        let reports = Rc::new(RefCell::new(0usize));
        let sink = Rc::clone(&reports);
        engine.set_reporter(Rc::new(move |_: &fstate_core::Diagnostic| *sink.borrow_mut() += 1));
        let list = engine.wrap(&Value::list(initial.iter().copied())).unwrap();
        let view = immutable(&list);
        for op in &ops {
            prop_assert!(view.apply(to_mutation(op, initial.len())).unwrap().is_none());
        }
        prop_assert_eq!(ints(&list), initial);
        prop_assert_eq!(*reports.borrow(), ops.len());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Record writes
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn record_writes_match_model(
        writes in proptest::collection::vec(("[a-d]", proptest::option::of(-9i64..9)), 0..30),
    ) {
        let engine = Engine::new();
        let node = engine.wrap(&Value::record(Vec::<(&str, i64)>::new())).unwrap();
        let mut model: indexmap::IndexMap<String, i64> = indexmap::IndexMap::new();
        let (log, _sub) = counting(&node);
        let mut expected_events = 0usize;
        for (key, value) in &writes {
            match value {
                Some(v) => {
                    if model.get(key) != Some(v) {
                        expected_events += 1;
                    }
                    node.set(key.as_str(), *v).unwrap();
                    model.insert(key.clone(), *v);
                }
                None => {
                    if model.shift_remove(key).is_some() {
                        expected_events += 1;
                    }
                    node.delete(key.as_str()).unwrap();
                }
            }
        }
        let actual: Vec<(String, i64)> = node
            .entries()
            .into_iter()
            .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_i64()?)))
            .collect();
        let expected: Vec<(String, i64)> = model.into_iter().collect();
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(log.borrow().len(), expected_events);
    }
}
