#![forbid(unsafe_code)]

//! FrankenState public facade crate.
//!
//! Free functions here act on the thread's default engine
//! ([`Engine::global`]). Code that needs isolation (tests, several
//! independent stores) should create its own [`Engine`] instead.
//!
//! ```
//! use fstate::prelude::*;
//!
//! let todo = fstate::wrap(&Value::record([("done", false)])).unwrap();
//! let view = fstate::immutable(&todo);
//! view.set("done", true).unwrap();
//! assert_eq!(todo.get("done"), Some(Value::Bool(false)));
//! ```

pub use fstate_core::{
    AllowList, ChangeKind, Derived, Diagnostic, Engine, EngineConfig, Key, Mutate, Mutation,
    ReadOnly, Result, State, StateChange, StateError, SubscribeOptions, Subscription, Value,
    WrapOptions, Writable,
};

pub mod prelude {
    pub use fstate_core as core;
    #[cfg(feature = "runtime")]
    pub use fstate_runtime as runtime;

    pub use fstate_core::{Key, Mutate, State, StateChange, Value};
}

/// Wrap `value` in the default engine.
pub fn wrap(value: &Value) -> Result<State> {
    Engine::global().wrap(value)
}

pub fn wrap_with(value: &Value, options: WrapOptions) -> Result<State> {
    Engine::global().wrap_with(value, options)
}

/// The node for an already wrapped container, if any.
#[must_use]
pub fn lookup(value: &Value) -> Option<State> {
    Engine::global().lookup(value)
}

pub fn subscribe(state: &State, f: impl Fn(&StateChange) + 'static) -> Subscription {
    state.subscribe(f)
}

#[must_use]
pub fn immutable(state: &State) -> ReadOnly {
    fstate_core::immutable(state)
}

#[must_use]
pub fn writable(state: &State, allow: Option<AllowList>) -> Writable {
    fstate_core::writable(state, allow)
}

pub fn track<T>(f: impl FnOnce() -> T) -> fstate_core::Tracked<T> {
    Engine::global().track(f)
}

pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    Engine::global().untracked(f)
}

pub fn derive<T: 'static>(f: impl Fn() -> T + 'static) -> Derived<T> {
    Engine::global().derive(f)
}

pub fn destroy(state: &State) {
    state.engine().destroy(state);
}

/// Capture the changes `f` makes in the default engine for a later undo.
#[cfg(feature = "runtime")]
pub fn undoable<T>(f: impl FnOnce() -> T) -> fstate_runtime::Undoable<T> {
    fstate_runtime::undoable(&Engine::global(), f)
}

#[cfg(feature = "runtime")]
pub use fstate_runtime::{
    Binding, History, HistoryOptions, Scheduler, bind, history, microbatch, micropush, microtask,
};
