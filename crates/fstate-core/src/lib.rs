#![forbid(unsafe_code)]

//! Core: value model, node registry, mutation interception, broadcast,
//! contracts, dependency tracking, and lifecycle scopes.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use fstate_core::{Engine, Key, Mutate, RecordSchema, Value, ValueType, WrapOptions};
//!
//! let engine = Engine::new();
//! let schema = RecordSchema::new().field("count", ValueType::Int);
//! let counter = engine
//!     .wrap_with(
//!         &Value::record([("count", 0)]),
//!         WrapOptions::default().strict().with_schema(schema),
//!     )
//!     .unwrap();
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//! let _sub = counter.subscribe(move |change| sink.borrow_mut().push(change.keys.clone()));
//!
//! counter.set("count", 1).unwrap();
//! assert!(counter.set("count", "one").is_err());
//! assert_eq!(*seen.borrow(), [vec![], vec![Key::from("count")]]);
//! ```

pub mod bus;
pub mod change;
pub mod computed;
pub mod contract;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod lifecycle;
#[cfg(feature = "tracing-json")]
pub mod logging;
pub mod mutation;
pub mod registry;
pub mod schema;
pub mod state;
pub mod tracker;
pub mod value;

pub use bus::{Handler, SubscribeOptions, Subscription};
pub use change::{ChangeKind, StateChange};
pub use computed::{ComputedField, Derived};
pub use contract::{AllowList, ReadOnly, Writable, immutable, writable};
pub use diagnostics::{Diagnostic, Reporter, tracing_reporter};
pub use engine::{Engine, EngineConfig, EngineStats, Tap, TapFn, WrapOptions};
pub use error::{RegistryError, Result, StateError, ValidationError};
pub use lifecycle::{Cleanup, CleanupHandler, Lifecycle, on_cleanup, set_cleanup_handler};
pub use mutation::{Comparator, Mutation};
pub use registry::{Link, NodeConfig, NodeId, NodeMeta, Registry};
pub use schema::{RecordSchema, Schema, SchemaIssue, ValueType};
pub use state::{Mutate, State};
pub use tracker::{Dependencies, Dependency, Tracked};
pub use value::{Container, ContainerKind, Key, RawId, Value, classify};
