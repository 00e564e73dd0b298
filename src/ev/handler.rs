//! Handler protocol: request kinds, callbacks and the [`Handler`] trait.
//!
//! A handler services one or more request kinds. `handle` runs on the
//! scheduler task and must return quickly: blocking work is spawned onto
//! tokio tasks, which report back through [`Loop::call`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Result;

use super::Loop;
use super::request::{Outcome, Request};

// ============================================================================
// RequestKind
// ============================================================================

/// Key under which handlers are registered in a [`Loop`].
///
/// Several handlers may share a kind; every one of them is invoked for
/// each request of that kind, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKind(u16);

impl RequestKind {
    /// WebSocket client networking: connect, send, receive.
    pub const WS_CLIENT: Self = Self(100);

    /// WebSocket server networking: listen.
    pub const WS_SERVER: Self = Self(101);

    /// Handler-driven timers.
    pub const DELAY: Self = Self(102);

    /// Identity handler.
    pub const PASSTHROUGH: Self = Self(103);

    /// Creates a custom kind.
    #[inline]
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::WS_CLIENT => f.write_str("ws-client"),
            Self::WS_SERVER => f.write_str("ws-server"),
            Self::DELAY => f.write_str("delay"),
            Self::PASSTHROUGH => f.write_str("passthrough"),
            Self(value) => write!(f, "{value}"),
        }
    }
}

// ============================================================================
// Callback
// ============================================================================

type CallbackFn = dyn FnMut(Result<Outcome>) + Send;

/// Completion callback attached to a request.
///
/// Subscription-style requests (receive, listen, repeating delays) invoke
/// the same callback many times. Cloning shares the underlying closure.
/// Invocations are expected on the loop's scheduler task, so they never
/// overlap.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<Mutex<Box<CallbackFn>>>,
}

impl Callback {
    /// Wraps a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(Result<Outcome>) + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(f))),
        }
    }

    /// A callback that discards every result.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Invokes the closure with `result`.
    pub fn invoke(&self, result: Result<Outcome>) {
        let mut f = self.inner.lock();
        (*f)(result);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Polymorphic unit servicing one or more request kinds.
pub trait Handler: Send + Sync + 'static {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Called once per [`Loop::register`].
    ///
    /// # Errors
    ///
    /// Returning an error rejects the registration.
    fn init(&self, _ev: &Loop) -> Result<()> {
        Ok(())
    }

    /// Services `request`, reporting results through `callback`.
    ///
    /// Runs on the scheduler task; must only launch asynchronous work.
    ///
    /// # Errors
    ///
    /// An error is delivered to `callback` by the loop; other requests are
    /// unaffected.
    fn handle(&self, ev: &Loop, request: Request, callback: Callback) -> Result<()>;

    /// Returns `true` while work launched for `ev` is outstanding.
    fn is_active(&self, ev: &Loop) -> bool;

    /// Abandons delivery of further callbacks.
    fn stop(&self);
}

// ============================================================================
// PendingGuard
// ============================================================================

/// Counts one in-flight operation for a handler's `is_active`.
///
/// Dropping the guard decrements the counter and wakes the loop so it
/// re-evaluates idleness.
pub struct PendingGuard {
    counter: Arc<AtomicUsize>,
    ev: Loop,
}

impl PendingGuard {
    /// Increments `counter` until the guard is dropped.
    #[must_use]
    pub fn new(counter: &Arc<AtomicUsize>, ev: &Loop) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
            ev: ev.clone(),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        self.ev.wake();
    }
}

impl fmt::Debug for PendingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingGuard")
            .field("pending", &self.counter.load(Ordering::Acquire))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_kind_display() {
        assert_eq!(RequestKind::WS_CLIENT.to_string(), "ws-client");
        assert_eq!(RequestKind::new(7).to_string(), "7");
    }

    #[test]
    fn test_callback_shared_between_clones() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = Callback::new(move |result| {
            if let Ok(Outcome::Value(v)) = result {
                sink.lock().push(v);
            }
        });

        let other = cb.clone();
        cb.invoke(Ok(Outcome::Value(json!(1))));
        other.invoke(Ok(Outcome::Value(json!(2))));

        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_pending_guard_counts() {
        let ev = Loop::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let a = PendingGuard::new(&counter, &ev);
        let b = PendingGuard::new(&counter, &ev);
        assert_eq!(counter.load(Ordering::Acquire), 2);

        drop(a);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(b);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
