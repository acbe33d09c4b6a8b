#![no_main]

use fstate_core::{Engine, Value, WrapOptions};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let value = Value::from_json(&json);
    let engine = Engine::new();
    let Ok(state) = engine.wrap(&value) else {
        return;
    };
    assert_eq!(state.to_json(), json);
    let _ = engine.wrap_with(&value, WrapOptions::default().cloned());
    engine.teardown();
    assert_eq!(engine.stats().nodes, 0);
});
