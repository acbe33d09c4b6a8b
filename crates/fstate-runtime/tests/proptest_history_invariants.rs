//! Property-based invariant tests for history and scheduling.
//!
//! Verifies:
//!
//! 1. Walking a history all the way back restores the initial value, and
//!    all the way forward restores the final value.
//! 2. A one-shot undo restores the value captured before the call.
//! 3. Timers fire in (deadline, scheduling order) and cancelled timers
//!    never fire.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use fstate_core::{Engine, Mutate, State, Value};
use fstate_runtime::{History, HistoryOptions, Scheduler, undoable};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Set(String, i64),
    Delete(String),
    Push(i64),
    Shift,
    Reverse,
    Commit,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        ("[a-c]", -9i64..9).prop_map(|(k, v)| Op::Set(k, v)),
        "[a-c]".prop_map(Op::Delete),
        (-9i64..9).prop_map(Op::Push),
        Just(Op::Shift),
        Just(Op::Reverse),
        Just(Op::Commit),
    ]
}

fn fixture(engine: &Engine) -> State {
    engine
        .wrap(&Value::record([
            ("a", Value::Int(1)),
            ("items", Value::list([1, 2, 3])),
        ]))
        .unwrap()
}

fn run(root: &State, op: &Op, hist: Option<&History>) {
    let items = root.child("items").unwrap();
    match op {
        Op::Set(k, v) => root.set(k.as_str(), *v).unwrap(),
        Op::Delete(k) => {
            root.delete(k.as_str()).unwrap();
        }
        Op::Push(v) => items.push(*v).unwrap(),
        Op::Shift => {
            items.shift().unwrap();
        }
        Op::Reverse => items.reverse().unwrap(),
        Op::Commit => {
            if let Some(hist) = hist {
                hist.commit();
            }
        }
    }
}

proptest! {
    #[test]
    fn history_round_trips(ops in proptest::collection::vec(op(), 0..25)) {
        let engine = Engine::new();
        let root = fixture(&engine);
        let initial = root.to_json();
        let hist = History::new(&root, HistoryOptions::default(), &Scheduler::lab());

        for op in &ops {
            run(&root, op, Some(&hist));
        }
        let last = root.to_json();

        while hist.backward().unwrap() {}
        prop_assert_eq!(root.to_json(), initial);
        while hist.forward().unwrap() {}
        prop_assert_eq!(root.to_json(), last);
    }

    #[test]
    fn undoable_restores_snapshot(ops in proptest::collection::vec(op(), 0..25)) {
        let engine = Engine::new();
        let root = fixture(&engine);
        let before = root.to_json();
        let mut undo = undoable(&engine, || {
            for op in &ops {
                run(&root, op, None);
            }
        });
        undo.undo().unwrap();
        prop_assert_eq!(root.to_json(), before);
    }

    #[test]
    fn timers_fire_in_order(
        delays in proptest::collection::vec(0u64..50, 1..20),
        cancel in proptest::collection::vec(proptest::bool::ANY, 20),
    ) {
        let scheduler = Scheduler::lab();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut expected = Vec::new();
        for (seq, delay) in delays.iter().enumerate() {
            let sink = Rc::clone(&fired);
            let id = scheduler.schedule(Duration::from_millis(*delay), move || {
                sink.borrow_mut().push(seq);
            });
            if cancel[seq] {
                prop_assert!(scheduler.cancel(id));
            } else {
                expected.push((*delay, seq));
            }
        }
        expected.sort();
        scheduler.advance(Duration::from_millis(50));
        let order: Vec<usize> = expected.into_iter().map(|(_, seq)| seq).collect();
        prop_assert_eq!(&*fired.borrow(), &order);
        prop_assert_eq!(scheduler.pending(), 0);
    }
}
