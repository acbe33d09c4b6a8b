#![forbid(unsafe_code)]

//! Cleanup collection scopes.
//!
//! [`on_cleanup`] registers a teardown callback with the innermost
//! [`Lifecycle`] currently running. Outside any collector it goes to the
//! handler installed with [`set_cleanup_handler`] if there is one, and to
//! the thread-local fallback scope ([`Lifecycle::global`]) otherwise.
//!
//! Collectors are restored by guards, so a panic inside
//! [`Lifecycle::run`] still pops its scope.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tracing::trace;

use crate::bus::Subscription;
use crate::state::State;

/// A deferred teardown callback.
pub type Cleanup = Box<dyn FnOnce()>;

/// Receives cleanups registered outside any collector.
pub type CleanupHandler = Rc<dyn Fn(Cleanup)>;

thread_local! {
    static COLLECTORS: RefCell<Vec<Lifecycle>> = const { RefCell::new(Vec::new()) };
    static FALLBACK: Lifecycle = Lifecycle::new();
    static HANDLER: RefCell<Option<CleanupHandler>> = const { RefCell::new(None) };
}

/// An ordered set of cleanups run together by [`Lifecycle::destroy`].
///
/// Cloning shares the same set.
#[derive(Clone, Default)]
pub struct Lifecycle {
    cleanups: Rc<RefCell<Vec<Cleanup>>>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("pending", &self.len())
            .finish()
    }
}

impl PartialEq for Lifecycle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cleanups, &other.cleanups)
    }
}

struct CollectorGuard;

impl CollectorGuard {
    fn enter(lifecycle: &Lifecycle) -> Self {
        COLLECTORS.with(|stack| stack.borrow_mut().push(lifecycle.clone()));
        Self
    }
}

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        let popped = COLLECTORS.with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread-local fallback scope.
    #[must_use]
    pub fn global() -> Self {
        FALLBACK.with(Clone::clone)
    }

    /// The innermost collector on this thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        COLLECTORS.with(|stack| stack.borrow().last().cloned())
    }

    /// Add a cleanup to this scope directly.
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        self.cleanups.borrow_mut().push(Box::new(cleanup));
    }

    /// Keep `subscription` alive until this scope is destroyed.
    pub fn keep(&self, subscription: Subscription) {
        self.on_cleanup(move || subscription.unsubscribe());
    }

    /// Destroy `state`'s node when this scope is destroyed.
    pub fn own(&self, state: &State) {
        let state = state.clone();
        self.on_cleanup(move || {
            if state.is_alive() {
                state.destroy();
            }
        });
    }

    /// Run `f` with this scope as the active collector.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = CollectorGuard::enter(self);
        f()
    }

    /// Wrap `future` so this scope is the active collector during every
    /// poll.
    pub fn run_async<F: Future>(&self, future: F) -> Collecting<F> {
        Collecting {
            lifecycle: self.clone(),
            future: Box::pin(future),
        }
    }

    /// Run every collected cleanup once, in registration order.
    ///
    /// Cleanups registered while this runs are kept for the next call.
    pub fn destroy(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        trace!(count = cleanups.len(), "lifecycle destroyed");
        for cleanup in cleanups {
            cleanup();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cleanups.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Future returned by [`Lifecycle::run_async`].
#[must_use = "futures do nothing unless polled"]
pub struct Collecting<F> {
    lifecycle: Lifecycle,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for Collecting<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = CollectorGuard::enter(&this.lifecycle);
        this.future.as_mut().poll(cx)
    }
}

/// Register `cleanup` with the active collector.
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) {
    if let Some(collector) = Lifecycle::current() {
        collector.on_cleanup(cleanup);
        return;
    }
    let handler = HANDLER.with(|h| h.borrow().clone());
    match handler {
        Some(handler) => handler(Box::new(cleanup)),
        None => Lifecycle::global().on_cleanup(cleanup),
    }
}

/// Install the handler for cleanups registered outside any collector,
/// returning the previous one. `None` restores the fallback scope.
pub fn set_cleanup_handler(handler: Option<CleanupHandler>) -> Option<CleanupHandler> {
    HANDLER.with(|h| std::mem::replace(&mut *h.borrow_mut(), handler))
}
