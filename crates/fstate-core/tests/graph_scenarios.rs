//! End-to-end behavior of the state graph through the public API.
//!
//! Covers change delivery for records, lists, and nested containers,
//! strict validation, relinking when children move between parents,
//! cyclic graphs, read-only enforcement, and cross-wired emitters.

use std::cell::RefCell;
use std::rc::Rc;

use fstate_core::{
    ChangeKind, Diagnostic, Engine, EngineConfig, Key, Mutate, RecordSchema, StateChange,
    StateError, SubscribeOptions, Subscription, Value, ValueType, WrapOptions, immutable,
};

fn record_changes(
    state: &fstate_core::State,
) -> (Rc<RefCell<Vec<StateChange>>>, Subscription) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let sub = state.subscribe_with(
        Rc::new(move |c: &StateChange| sink.borrow_mut().push(c.clone())),
        SubscribeOptions::quiet(),
    );
    (log, sub)
}

fn ints(state: &fstate_core::State) -> Vec<i64> {
    state.values().iter().filter_map(Value::as_i64).collect()
}

// ── Core flows ──────────────────────────────────────────────────────────

#[test]
fn record_field_write_delivers_one_set() {
    let engine = Engine::new();
    let node = engine.wrap(&Value::record([("count", 0)])).unwrap();
    let (log, _sub) = record_changes(&node);

    node.set("count", 5).unwrap();

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    let change = &log[0];
    assert_eq!(change.kind, ChangeKind::Set);
    assert_eq!(change.keys, vec![Key::from("count")]);
    assert_eq!(change.value, Some(Value::Int(5)));
    assert_eq!(change.prev, Some(Value::Int(0)));
}

#[test]
fn list_append_then_remove_first() {
    let engine = Engine::new();
    let list = engine.wrap(&Value::list([1, 2, 3])).unwrap();
    let (log, _sub) = record_changes(&list);

    list.push(4).unwrap();
    list.delete(0).unwrap();

    assert_eq!(ints(&list), [2, 3, 4]);
    let kinds: Vec<ChangeKind> = log.borrow().iter().map(|c| c.kind).collect();
    assert_eq!(kinds, [ChangeKind::Append, ChangeKind::Splice]);
}

#[test]
fn nested_write_reaches_root_with_full_path() {
    let engine = Engine::new();
    let root = engine
        .wrap(&Value::record([("a", Value::record([("b", 1)]))]))
        .unwrap();
    let (log, _sub) = record_changes(&root);

    root.child("a").unwrap().set("b", 2).unwrap();

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].keys, vec![Key::from("a"), Key::from("b")]);
    assert_eq!(log[0].origin_path(), &[Key::from("a")]);
}

#[test]
fn strict_validation_failure_leaves_value_unchanged() {
    let engine = Engine::new();
    let schema = RecordSchema::new()
        .field("name", ValueType::Str)
        .field("age", ValueType::Int);
    let person = engine
        .wrap_with(
            &Value::record([("name", Value::from("Ada")), ("age", Value::Int(36))]),
            WrapOptions::default().strict().with_schema(schema),
        )
        .unwrap();
    let before = person.to_json();
    let (log, _sub) = record_changes(&person);

    let err = person.set("age", "old").unwrap_err();

    assert!(matches!(err, StateError::Validation(_)));
    assert_eq!(person.to_json(), before);
    assert!(log.borrow().is_empty());
}

#[test]
fn env_strict_config_applies_to_default_wraps() {
    let config = EngineConfig::default()
        .with_node_config(fstate_core::NodeConfig::RECURSIVE | fstate_core::NodeConfig::STRICT);
    let engine = Engine::with_config(config);
    let node = engine
        .wrap_with(
            &Value::record([("n", 1)]),
            WrapOptions::default().with_schema(RecordSchema::new().field("n", ValueType::Int)),
        )
        .unwrap();
    assert!(node.set("n", Value::Null).is_err());
}

// ── Identity and links ──────────────────────────────────────────────────

#[test]
fn wrapping_twice_yields_the_same_node() {
    let engine = Engine::new();
    let value = Value::record([("nested", Value::list([1]))]);
    let a = engine.wrap(&value).unwrap();
    let b = engine.wrap(&value).unwrap();
    assert_eq!(a, b);
    let nested = value.as_container().unwrap().get(&Key::from("nested")).unwrap();
    assert_eq!(engine.wrap(&nested).unwrap(), a.child("nested").unwrap());
}

#[test]
fn moved_child_survives_destroying_old_parent() {
    let engine = Engine::new();
    let a = engine
        .wrap(&Value::record([("item", Value::record([("v", 1)]))]))
        .unwrap();
    let b = engine.wrap(&Value::record([("slot", Value::Null)])).unwrap();
    let item = a.child("item").unwrap();

    b.set("slot", item.value()).unwrap();
    a.delete("item").unwrap();

    assert_eq!(item.parent(), Some(b.id()));
    assert!(!engine.registry().holds(a.id(), item.id()));

    engine.destroy(&a);
    assert!(item.is_alive());

    let (log, _sub) = record_changes(&b);
    item.set("v", 2).unwrap();
    assert_eq!(log.borrow()[0].keys, vec![Key::from("slot"), Key::from("v")]);
}

#[test]
fn shared_child_is_retained_until_last_holder_releases() {
    let engine = Engine::new();
    let shared = Value::record([("v", 1)]);
    let root = engine
        .wrap(&Value::record([("x", shared.clone()), ("y", shared.clone())]))
        .unwrap();
    let child = root.child("x").unwrap();

    root.delete("x").unwrap();
    assert_eq!(child.parent(), Some(root.id()));

    let (log, _sub) = record_changes(&root);
    child.set("v", 2).unwrap();
    assert_eq!(log.borrow()[0].keys, vec![Key::from("y"), Key::from("v")]);

    root.delete("y").unwrap();
    assert_eq!(child.parent(), None);
    assert!(!child.is_alive());
    assert_eq!(engine.stats().nodes, 1);
}

#[test]
fn replaced_children_are_reclaimed() {
    let engine = Engine::new();
    let root = engine
        .wrap(&Value::record([("a", Value::record([("x", 0)]))]))
        .unwrap();
    let first = root.child("a").unwrap();
    let hooks = Rc::new(RefCell::new(0));
    let fired = Rc::clone(&hooks);
    first.on_destroy(move || *fired.borrow_mut() += 1);
    let before = engine.stats().nodes;

    for i in 0..50 {
        root.set("a", Value::record([("x", i)])).unwrap();
        root.child("a").unwrap().set("x", i + 1).unwrap();
    }

    assert_eq!(engine.stats().nodes, before);
    assert!(!first.is_alive());
    assert_eq!(*hooks.borrow(), 1);
}

#[test]
fn removed_list_items_are_reclaimed_but_wrapped_roots_survive() {
    let engine = Engine::new();
    let list = engine
        .wrap(&Value::list([Value::record([("v", 1)])]))
        .unwrap();
    let item = list.child(0).unwrap();
    let standalone = engine.wrap(&Value::record([("v", 2)])).unwrap();
    list.push(standalone.value()).unwrap();
    assert_eq!(engine.stats().nodes, 3);

    list.clear().unwrap();

    assert!(!item.is_alive());
    assert!(standalone.is_alive());
    assert_eq!(standalone.parent(), None);
    assert_eq!(engine.stats().nodes, 2);
}

#[test]
fn reordering_keeps_child_nodes() {
    let engine = Engine::new();
    let list = engine
        .wrap(&Value::list([
            Value::record([("v", 2)]),
            Value::record([("v", 1)]),
        ]))
        .unwrap();
    let item = list.child(0).unwrap();
    list.reverse().unwrap();
    assert!(item.is_alive());
    assert_eq!(item.parent(), Some(list.id()));
    assert_eq!(engine.stats().nodes, 3);
}

#[test]
fn destroying_parent_cascades_to_sole_children() {
    let engine = Engine::new();
    let root = engine
        .wrap(&Value::record([("a", Value::record([("b", Value::list([1]))]))]))
        .unwrap();
    let a = root.child("a").unwrap();
    let b = a.child("b").unwrap();
    assert_eq!(engine.stats().nodes, 3);

    root.destroy();

    assert!(!a.is_alive());
    assert!(!b.is_alive());
    assert_eq!(engine.stats().nodes, 0);
    assert!(matches!(b.push(2), Err(StateError::UnknownNode(_))));
}

#[test]
fn cyclic_graph_bubbles_once_per_node() {
    let engine = Engine::new();
    let a = engine.wrap(&Value::record([("n", 0)])).unwrap();
    let b = engine.wrap(&Value::record([("n", 0)])).unwrap();
    a.set("peer", b.value()).unwrap();
    b.set("peer", a.value()).unwrap();

    let (a_log, _a) = record_changes(&a);
    let (b_log, _b) = record_changes(&b);
    b.set("n", 1).unwrap();

    assert_eq!(b_log.borrow().len(), 1);
    assert_eq!(a_log.borrow().len(), 1);
    assert_eq!(a_log.borrow()[0].keys, vec![Key::from("peer"), Key::from("n")]);
}

#[test]
fn deep_copy_of_cycle_preserves_shape() {
    let engine = Engine::new();
    let a = engine.wrap(&Value::record([("n", 1)])).unwrap();
    a.set("me", a.value()).unwrap();
    let copy = engine
        .wrap_with(&a.value(), WrapOptions::default().cloned())
        .unwrap();
    assert_ne!(copy, a);
    let inner = copy.get("me").unwrap();
    assert!(inner.as_container().unwrap().ptr_eq(copy.raw()));
}

// ── Contracts and emitters ──────────────────────────────────────────────

#[test]
fn read_only_view_reports_exactly_once_per_attempt() {
    let engine = Engine::new();
    let reports = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reports);
    engine.set_reporter(Rc::new(move |d: &Diagnostic| sink.borrow_mut().push(d.clone())));
    let node = engine.wrap(&Value::record([("a", 1)])).unwrap();
    let view = immutable(&node);

    view.set("a", 2).unwrap();
    view.delete("a").unwrap();
    view.assign(Value::record([("b", 3)])).unwrap();

    assert_eq!(node.get("a"), Some(Value::Int(1)));
    assert!(!node.contains("b"));
    assert_eq!(reports.borrow().len(), 3);
    assert!(
        reports
            .borrow()
            .iter()
            .all(|d| matches!(d, Diagnostic::ContractViolation { .. }))
    );
}

#[test]
fn receiver_skips_changes_it_emitted() {
    let engine = Engine::new();
    let node = engine.wrap(&Value::record([("a", 1)])).unwrap();
    let me = engine.new_origin();
    let seen = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&seen);
    let _sub = node.subscribe_with(
        Rc::new(move |_: &StateChange| *counter.borrow_mut() += 1),
        SubscribeOptions::quiet().receiver(me),
    );

    engine.emit_as(me, || node.set("a", 2)).unwrap();
    node.set("a", 3).unwrap();

    assert_eq!(*seen.borrow(), 1);
}

#[test]
fn subscriber_may_mutate_during_delivery() {
    let engine = Engine::new();
    let node = engine.wrap(&Value::record([("a", 0), ("echo", 0)])).unwrap();
    let writer = node.clone();
    let _sub = node.subscribe(move |change| {
        if change.slot() == Some(&Key::from("a")) {
            let v = change.value.as_ref().and_then(Value::as_i64).unwrap_or(0);
            writer.set("echo", v * 10).unwrap();
        }
    });

    node.set("a", 4).unwrap();

    assert_eq!(node.get("echo"), Some(Value::Int(40)));
}

#[test]
fn unsubscribing_inside_handler_stops_later_delivery() {
    let engine = Engine::new();
    let node = engine.wrap(&Value::record([("a", 0)])).unwrap();
    let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
    let hits = Rc::new(RefCell::new(0));
    let (slot_in, hits_in) = (Rc::clone(&slot), Rc::clone(&hits));
    let sub = node.subscribe_with(
        Rc::new(move |_: &StateChange| {
            *hits_in.borrow_mut() += 1;
            if let Some(sub) = slot_in.borrow().as_ref() {
                sub.unsubscribe();
            }
        }),
        SubscribeOptions::quiet(),
    );
    *slot.borrow_mut() = Some(sub);

    node.set("a", 1).unwrap();
    node.set("a", 2).unwrap();

    assert_eq!(*hits.borrow(), 1);
}
