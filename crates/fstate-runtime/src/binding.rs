#![forbid(unsafe_code)]

//! Two-way mirroring between two nodes of one engine.
//!
//! A [`Binding`] copies `left` into `right` once, then replays every change
//! on either side onto the other at the same relative path. Mirrored writes
//! are emitted under the binding's own origin, and both subscriptions
//! ignore that origin, so a change never bounces back to where it came
//! from.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use fstate_core::{
    ContainerKind, Engine, Handler, Mutate, NodeId, Result, State, StateChange, SubscribeOptions,
    Subscription, Value,
};
use tracing::{trace, warn};

use crate::history::resolve;

/// Live two-way link. Dropping it stops mirroring.
pub struct Binding {
    left: State,
    right: State,
    origin: NodeId,
    subscriptions: Vec<Subscription>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("left", &self.left.id())
            .field("right", &self.right.id())
            .field("origin", &self.origin)
            .finish()
    }
}

fn detached(value: Option<Value>) -> Option<Value> {
    value.map(|value| match value {
        Value::Container(raw) => Value::Container(raw.deep_copy()),
        other => other,
    })
}

fn mirror(engine: &Engine, origin: NodeId, target: &State, change: &StateChange) -> Result<()> {
    let mut change = change.clone();
    change.value = detached(change.value);
    change.prev = detached(change.prev);
    engine.emit_as(origin, || {
        let node = resolve(target, change.origin_path())?;
        for mutation in change.replay() {
            node.apply(mutation)?;
        }
        Ok(())
    })
}

fn handler(
    engine: &Engine,
    origin: NodeId,
    target: &State,
    busy: &Rc<Cell<bool>>,
) -> Handler {
    let engine = engine.clone();
    let target = target.clone();
    let busy = Rc::clone(busy);
    Rc::new(move |change: &StateChange| {
        if busy.get() || !target.is_alive() {
            trace!(target = %target.id(), "mirror skipped");
            return;
        }
        busy.set(true);
        let outcome = mirror(&engine, origin, &target, change);
        busy.set(false);
        if let Err(err) = outcome {
            warn!(target = %target.id(), kind = %change.kind, error = %err, "mirror failed");
        }
    })
}

/// Copy `left` into `right`, then keep them in sync.
pub fn bind(left: &State, right: &State) -> Result<Binding> {
    Binding::new(left, right)
}

impl Binding {
    pub fn new(left: &State, right: &State) -> Result<Self> {
        let engine = left.engine().clone();
        let origin = engine.new_origin();
        engine.emit_as(origin, || sync(left, right))?;

        let busy = Rc::new(Cell::new(false));
        let options = SubscribeOptions::quiet().receiver(origin);
        let subscriptions = vec![
            left.subscribe_with(handler(&engine, origin, right, &busy), options),
            right.subscribe_with(handler(&engine, origin, left, &busy), options),
        ];
        Ok(Self {
            left: left.clone(),
            right: right.clone(),
            origin,
            subscriptions,
        })
    }

    #[must_use]
    pub fn left(&self) -> &State {
        &self.left
    }

    #[must_use]
    pub fn right(&self) -> &State {
        &self.right
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.subscriptions.iter().all(Subscription::is_active)
    }

    /// Stop mirroring in both directions.
    pub fn unbind(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.unbind();
    }
}

fn sync(from: &State, to: &State) -> Result<()> {
    let copy = from.raw().deep_copy();
    match to.kind() {
        ContainerKind::List => {
            to.splice(0, to.len(), copy.values())?;
        }
        ContainerKind::Set => {
            to.clear()?;
            to.assign(Value::Container(copy))?;
        }
        ContainerKind::Record | ContainerKind::Map => {
            to.assign(Value::Container(copy))?;
        }
    }
    Ok(())
}
