//! Timer handler backed by tokio time.
//!
//! Unlike [`Loop::timeout`], which rides the scheduler clock, a
//! [`Delay`] request runs on its own task and reports each fire through
//! [`Loop::call`] as [`Outcome::Elapsed`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

use crate::error::{Error, Result};
use crate::ev::{Callback, Delay, Handler, Loop, Outcome, PendingGuard, Request};
use crate::sync::Signal;

// ============================================================================
// DelayHandler
// ============================================================================

/// Services [`Request::Delay`].
///
/// A one-shot delay fires once. A ticker fires every `delay` until its
/// ticket is stopped, the handler stops, or the loop is done.
pub struct DelayHandler {
    pending: Arc<AtomicUsize>,
    stop: Signal,
}

impl DelayHandler {
    /// Creates an idle handler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            stop: Signal::new(),
        }
    }

    /// Returns the number of running delays.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn schedule(&self, ev: &Loop, request: Delay, callback: Callback) -> Result<()> {
        if request.repeat && request.delay.is_zero() {
            return Err(Error::config("repeating delay must be non-zero"));
        }

        let guard = PendingGuard::new(&self.pending, ev);
        let stop = self.stop.clone();
        let done = ev.done_signal();
        let ev = ev.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let ticket = request.ticket().clone();

            if !request.repeat {
                tokio::select! {
                    () = stop.wait() => return,
                    () = done.wait() => return,
                    () = ticket.wait() => return,
                    () = time::sleep(request.delay) => {}
                }
                ev.call(move || callback.invoke(Ok(Outcome::Elapsed(Instant::now()))));
                return;
            }

            let start = time::Instant::now() + request.delay;
            let mut interval = time::interval_at(start, request.delay);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = stop.wait() => return,
                    () = done.wait() => return,
                    () = ticket.wait() => return,
                    _ = interval.tick() => {}
                }
                trace!(delay = ?request.delay, "Tick");
                let callback = callback.clone();
                ev.call(move || callback.invoke(Ok(Outcome::Elapsed(Instant::now()))));
            }
        });

        Ok(())
    }
}

impl Default for DelayHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for DelayHandler {
    fn name(&self) -> &'static str {
        "delay"
    }

    fn handle(&self, ev: &Loop, request: Request, callback: Callback) -> Result<()> {
        match request {
            Request::Delay(delay) => self.schedule(ev, delay, callback),
            other => Err(Error::unsupported_request(self.name(), other.name())),
        }
    }

    fn is_active(&self, _ev: &Loop) -> bool {
        self.pending() > 0
    }

    fn stop(&self) {
        self.stop.fire();
    }
}

impl fmt::Debug for DelayHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayHandler")
            .field("pending", &self.pending())
            .field("stopped", &self.stop.is_fired())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
