#![no_main]

use arbitrary::Arbitrary;
use fstate_core::{Engine, Mutate, Value};
use fstate_runtime::undoable;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Set(u8, i8),
    Delete(u8),
    Push(i8),
    Pop,
    Shift,
    Unshift(i8),
    Splice { start: u8, delete: u8, items: Vec<i8> },
    Reverse,
    Sort,
    Rotate(i8),
    Fill { value: i8, start: u8, end: u8 },
    Nest(u8),
    Clear,
}

fuzz_target!(|ops: Vec<Op>| {
    let engine = Engine::new();
    let root = engine
        .wrap(&Value::record([("list", Value::list([1, 2, 3]))]))
        .expect("wrap fixture");
    let before = root.value().to_json();

    let mut undo = undoable(&engine, || {
        for op in ops.iter().take(256) {
            let Some(list) = root.child("list") else {
                return;
            };
            let _ = match op {
                Op::Set(i, v) => list.set(usize::from(*i), i64::from(*v)),
                Op::Delete(i) => list.delete(usize::from(*i)).map(drop),
                Op::Push(v) => list.push(i64::from(*v)),
                Op::Pop => list.pop().map(drop),
                Op::Shift => list.shift().map(drop),
                Op::Unshift(v) => list.unshift(i64::from(*v)),
                Op::Splice { start, delete, items } => list
                    .splice(
                        usize::from(*start),
                        usize::from(*delete),
                        items.iter().map(|v| Value::Int(i64::from(*v))),
                    )
                    .map(drop),
                Op::Reverse => list.reverse(),
                Op::Sort => list.sort(),
                Op::Rotate(by) => list.rotate(isize::from(*by)),
                Op::Fill { value, start, end } => {
                    list.fill(i64::from(*value), usize::from(*start)..usize::from(*end))
                }
                Op::Nest(key) => root.set(format!("n{key}").as_str(), Value::record([("v", 1)])),
                Op::Clear => list.clear(),
            };
        }
    });
    undo.undo().expect("undo");
    assert_eq!(root.value().to_json(), before);
});
