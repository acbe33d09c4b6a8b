#![forbid(unsafe_code)]

//! Per-node subscriber sets and the RAII [`Subscription`] guard.
//!
//! # Invariants
//!
//! 1. Subscribers are notified in registration order.
//! 2. Registering the same handler `Rc` twice on a node is a no-op.
//! 3. A subscriber removed during delivery is not called again, even if it
//!    was in the snapshot being iterated.
//! 4. `unsubscribe()` is idempotent.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::change::StateChange;
use crate::engine::EngineInner;
use crate::registry::NodeId;

/// Change callback.
pub type Handler = Rc<dyn Fn(&StateChange)>;

/// Options for [`Engine::subscribe_node`](crate::Engine::subscribe_node).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliver a synthetic `init` event with the current value first.
    pub emit_now: bool,
    /// Skip events whose emitter equals this identity.
    pub receiver: Option<NodeId>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            emit_now: true,
            receiver: None,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            emit_now: false,
            receiver: None,
        }
    }

    #[must_use]
    pub fn emit_now(mut self, emit_now: bool) -> Self {
        self.emit_now = emit_now;
        self
    }

    #[must_use]
    pub fn receiver(mut self, receiver: NodeId) -> Self {
        self.receiver = Some(receiver);
        self
    }
}

#[derive(Clone)]
pub(crate) struct Subscriber {
    pub id: u64,
    pub receiver: Option<NodeId>,
    pub handler: Handler,
    pub active: Rc<Cell<bool>>,
}

impl Subscriber {
    /// Whether `change` should reach this subscriber.
    pub fn accepts(&self, change: &StateChange) -> bool {
        self.active.get() && (self.receiver.is_none() || self.receiver != change.emitter)
    }
}

#[derive(Default, Clone)]
pub(crate) struct SubscriberSet {
    entries: Vec<Subscriber>,
}

impl SubscriberSet {
    pub fn contains_handler(&self, handler: &Handler) -> bool {
        self.entries.iter().any(|s| Rc::ptr_eq(&s.handler, handler))
    }

    pub fn push(&mut self, subscriber: Subscriber) {
        self.entries.push(subscriber);
    }

    /// Detach subscriber `id`. The caller drops it once no borrow is held.
    pub fn remove(&mut self, id: u64) -> Option<Subscriber> {
        let pos = self.entries.iter().position(|s| s.id == id)?;
        let sub = self.entries.remove(pos);
        sub.active.set(false);
        Some(sub)
    }

    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.entries.clone()
    }

    pub fn deactivate_all(&mut self) {
        for sub in self.entries.drain(..) {
            sub.active.set(false);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// RAII guard for a subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    engine: Weak<EngineInner>,
    node: NodeId,
    id: u64,
    armed: Cell<bool>,
}

impl Subscription {
    pub(crate) fn new(engine: Weak<EngineInner>, node: NodeId, id: u64) -> Self {
        Self {
            engine,
            node,
            id,
            armed: Cell::new(true),
        }
    }

    /// A guard that does nothing, returned when subscribing was a no-op.
    pub fn inert() -> Self {
        Self {
            engine: Weak::new(),
            node: NodeId::new(0),
            id: 0,
            armed: Cell::new(false),
        }
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.armed.get()
    }

    /// Remove the handler now. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if !self.armed.replace(false) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_subscriber(self.node, self.id);
        }
    }

    /// Keep the handler registered for the lifetime of the node.
    pub fn detach(self) {
        self.armed.set(false);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("node", &self.node)
            .field("id", &self.id)
            .field("active", &self.armed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;

    fn subscriber(id: u64, receiver: Option<NodeId>) -> Subscriber {
        Subscriber {
            id,
            receiver,
            handler: Rc::new(|_: &StateChange| {}),
            active: Rc::new(Cell::new(true)),
        }
    }

    #[test]
    fn receiver_suppression() {
        let sub = subscriber(1, Some(NodeId::new(7)));
        let own = StateChange::new(ChangeKind::Set).with_emitter(NodeId::new(7));
        let other = StateChange::new(ChangeKind::Set).with_emitter(NodeId::new(8));
        assert!(!sub.accepts(&own));
        assert!(sub.accepts(&other));
        assert!(subscriber(2, None).accepts(&own));
    }

    #[test]
    fn remove_deactivates_snapshot_copies() {
        let mut set = SubscriberSet::default();
        set.push(subscriber(1, None));
        set.push(subscriber(2, None));
        let snapshot = set.snapshot();
        assert!(set.remove(1).is_some());
        assert!(set.remove(1).is_none());
        assert!(!snapshot[0].active.get());
        assert!(snapshot[1].active.get());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn inert_subscription_is_inactive() {
        let sub = Subscription::inert();
        assert!(!sub.is_active());
        sub.unsubscribe();
    }

    #[test]
    fn options_builder() {
        let opts = SubscribeOptions::quiet().receiver(NodeId::new(3));
        assert!(!opts.emit_now);
        assert_eq!(opts.receiver, Some(NodeId::new(3)));
        assert!(SubscribeOptions::default().emit_now);
    }
}
