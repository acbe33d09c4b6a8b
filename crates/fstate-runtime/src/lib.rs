#![forbid(unsafe_code)]

//! Runtime services on top of the core state graph: timer-driven batching,
//! undo/redo history, and two-way bindings.
//!
//! # Example
//!
//! ```
//! use fstate_core::{Engine, Mutate, Value};
//! use fstate_runtime::{HistoryOptions, Scheduler, History, undoable};
//!
//! let engine = Engine::new();
//! let state = engine.wrap(&Value::record([("x", 0)])).unwrap();
//! let history = History::new(&state, HistoryOptions::default(), &Scheduler::lab());
//!
//! let mut undo = undoable(&engine, || {
//!     state.set("x", 1).unwrap();
//!     state.set("x", 2).unwrap();
//! });
//! history.commit();
//!
//! undo.undo().unwrap();
//! assert_eq!(state.get("x"), Some(Value::Int(0)));
//!
//! history.backward().unwrap();
//! assert_eq!(state.get("x"), Some(Value::Int(2)));
//! ```

pub mod binding;
pub mod history;
pub mod scheduler;

pub use binding::{Binding, bind};
pub use history::{History, HistoryEntry, HistoryOptions, Undoable, history, undoable};
pub use scheduler::{
    BatchFn, Clock, Executor, Microbatch, Micropush, Microtask, Scheduler, SchedulerGuard,
    TimerId, microbatch, micropush, microtask,
};
