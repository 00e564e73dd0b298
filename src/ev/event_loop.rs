//! The cooperative scheduler.
//!
//! One tokio task per [`Loop`] owns the queues, timers and lock flag. Every
//! user callback runs on that task, one at a time, so callbacks never
//! overlap. Background work reaches the loop only through [`Loop::call`].
//!
//! # Scheduling pass
//!
//! | Step | Condition | Action |
//! |------|-----------|--------|
//! | 1 | `shutdown` fired | finish |
//! | 2 | `stop` requested | stop timers, drain teardowns, stop handlers, lock |
//! | 3 | idle | run one teardown, or finish when none is left |
//! | 4 | busy | resample clock, fire due timers, drain queued calls, dispatch one request |
//!
//! After step 4 the task parks until a wake notification, the earliest timer
//! deadline, shutdown, or the idle re-check interval, whichever comes first.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::identifiers::LoopId;
use crate::sync::Signal;

use super::handler::{Callback, Handler, RequestKind};
use super::request::Request;
use super::timer::{ScheduledTimer, TimerEntry, TimerHandle};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on how long an idle-but-alive loop parks before re-checking
/// handler activity.
pub const DEFAULT_IDLE_RECHECK: Duration = Duration::from_millis(50);

// ============================================================================
// Types
// ============================================================================

type Event = Box<dyn FnOnce() + Send>;

struct PendingRequest {
    kind: RequestKind,
    request: Request,
    callback: Callback,
}

struct LoopState {
    handlers: FxHashMap<RequestKind, Vec<Arc<dyn Handler>>>,
    requests: VecDeque<PendingRequest>,
    events: VecDeque<Event>,
    teardowns: VecDeque<Event>,
    timers: Vec<ScheduledTimer>,
    now: Instant,
    locked: bool,
    closed: bool,
}

struct LoopInner {
    id: LoopId,
    state: Mutex<LoopState>,
    wake: Notify,
    idle_recheck: Duration,
    running: AtomicBool,
    stop_requested: AtomicBool,
    shutdown: Signal,
    done: Signal,
}

// ============================================================================
// Loop
// ============================================================================

/// Single-task cooperative event loop.
///
/// Cloning yields another handle to the same loop.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> wsev::Result<()> {
/// use std::time::Duration;
/// use wsev::ev::Loop;
///
/// let ev = Loop::new();
/// ev.timeout(Duration::from_millis(10), false, || println!("tick"));
/// ev.run()?;
/// ev.done().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Loop {
    inner: Arc<LoopInner>,
}

impl Loop {
    /// Creates a loop with the default idle re-check interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_recheck(DEFAULT_IDLE_RECHECK)
    }

    /// Creates a loop that re-checks handler activity at least every
    /// `idle_recheck` while parked.
    #[must_use]
    pub fn with_idle_recheck(idle_recheck: Duration) -> Self {
        let state = LoopState {
            handlers: FxHashMap::default(),
            requests: VecDeque::new(),
            events: VecDeque::new(),
            teardowns: VecDeque::new(),
            timers: Vec::new(),
            now: Instant::now(),
            locked: false,
            closed: false,
        };

        Self {
            inner: Arc::new(LoopInner {
                id: LoopId::next(),
                state: Mutex::new(state),
                wake: Notify::new(),
                idle_recheck,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                shutdown: Signal::new(),
                done: Signal::new(),
            }),
        }
    }

    /// Returns the loop identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.inner.id
    }

    /// Returns a non-owning handle.
    #[inline]
    #[must_use]
    pub fn downgrade(&self) -> WeakLoop {
        WeakLoop {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // Registration and submission
    // ========================================================================

    /// Associates `handler` with `kind`.
    ///
    /// Several handlers may share a kind; each request of that kind is
    /// dispatched to all of them in registration order.
    ///
    /// # Errors
    ///
    /// Returns the error from [`Handler::init`], in which case the handler
    /// is not registered.
    pub fn register(&self, kind: RequestKind, handler: Arc<dyn Handler>) -> Result<()> {
        handler.init(self)?;

        let mut state = self.inner.state.lock();
        state.handlers.entry(kind).or_default().push(handler);
        Ok(())
    }

    /// Enqueues a request. Silently dropped once the loop is locked.
    pub fn request(&self, kind: RequestKind, request: Request, callback: Callback) {
        {
            let mut state = self.inner.state.lock();
            if state.locked {
                trace!(loop_id = %self.inner.id, %kind, "Request dropped: loop locked");
                return;
            }
            state.requests.push_back(PendingRequest {
                kind,
                request,
                callback,
            });
        }
        self.wake();
    }

    /// Enqueues `f` to run on the scheduler task.
    ///
    /// Calls run in FIFO order and never overlap. Silently dropped once the
    /// loop is locked.
    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.locked {
                trace!(loop_id = %self.inner.id, "Call dropped: loop locked");
                return;
            }
            state.events.push_back(Box::new(f));
        }
        self.wake();
    }

    /// Schedules `f` after `delay`, repeatedly when `repeat` is set.
    ///
    /// Repeating timers are rescheduled from the clock sampled at each fire,
    /// so a slow pass delays later fires instead of bunching them. On a
    /// locked loop the returned handle is already stopped.
    pub fn timeout<F>(&self, delay: Duration, repeat: bool, f: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let entry = Arc::new(TimerEntry::new(delay, repeat, Box::new(f)));

        let accepted = {
            let mut state = self.inner.state.lock();
            if state.locked {
                false
            } else {
                let now = Instant::now();
                state.now = now;
                state.timers.push(ScheduledTimer {
                    next: now + delay,
                    entry: Arc::clone(&entry),
                });
                true
            }
        };

        if accepted {
            self.wake();
        } else {
            entry.drop_timer();
        }

        TimerHandle::new(entry, self.downgrade())
    }

    /// Registers `f` to run once the loop has no more work.
    ///
    /// Accepted even when the loop is locked, but dropped once it is done.
    pub fn teardown<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                trace!(loop_id = %self.inner.id, "Teardown dropped: loop done");
                return;
            }
            state.teardowns.push_back(Box::new(f));
        }
        self.wake();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the scheduler task.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when called outside a tokio runtime
    /// - [`Error::AlreadyRunning`] on a second call
    pub fn run(&self) -> Result<()> {
        let handle =
            Handle::try_current().map_err(|_| Error::config("Loop::run requires a tokio runtime"))?;

        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        let ev = self.clone();
        handle.spawn(async move { ev.schedule().await });

        debug!(loop_id = %self.inner.id, "Loop started");
        Ok(())
    }

    /// Requests graceful shutdown.
    ///
    /// Timers stop firing immediately. On its next pass the scheduler runs
    /// every queued teardown, stops all handlers and locks the loop. `done`
    /// fires once the remaining work drains; use [`Loop::shutdown`] to force
    /// it.
    pub fn stop(&self) {
        // A firing callback may need the state lock, so wait on timers
        // outside it.
        let entries: Vec<Arc<TimerEntry>> = {
            let state = self.inner.state.lock();
            state.timers.iter().map(|t| Arc::clone(&t.entry)).collect()
        };
        for entry in entries {
            entry.drop_timer();
        }
        self.inner.stop_requested.store(true, Ordering::Release);
        self.wake();
        debug!(loop_id = %self.inner.id, "Loop stop requested");
    }

    /// Fires `done` immediately, abandoning outstanding work.
    ///
    /// Queued requests, calls, teardowns and timers are dropped without
    /// running.
    pub fn shutdown(&self) {
        self.inner.shutdown.fire();
        if self.inner.done.fire() {
            info!(loop_id = %self.inner.id, "Loop shut down");
        }
        if !self.inner.running.load(Ordering::Acquire) {
            self.release_queues();
        }
        self.wake();
    }

    /// Waits until the loop has terminated.
    pub async fn done(&self) {
        self.inner.done.wait().await;
    }

    /// Returns the signal fired on termination.
    #[inline]
    #[must_use]
    pub fn done_signal(&self) -> Signal {
        self.inner.done.clone()
    }

    /// Returns `true` once the loop has terminated.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.is_fired()
    }

    /// Returns `true` once [`Loop::stop`] has locked the loop.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().locked
    }

    /// Returns `true` while any request, call, live timer or active handler
    /// remains.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        {
            let state = self.inner.state.lock();
            if !state.requests.is_empty() || !state.events.is_empty() {
                return true;
            }
            if state.timers.iter().any(|t| !t.entry.is_dropped()) {
                return true;
            }
        }

        self.handler_snapshot()
            .iter()
            .any(|handler| handler.is_active(self))
    }

    /// Nudges a parked scheduler to re-evaluate its state.
    ///
    /// Handlers call this when their activity changes without a `call`.
    #[inline]
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    async fn schedule(self) {
        loop {
            if self.inner.shutdown.is_fired() {
                break;
            }

            if self.inner.stop_requested.swap(false, Ordering::AcqRel) {
                self.stop_sequence();
                continue;
            }

            if !self.is_alive() {
                if self.next_teardown() {
                    continue;
                }
                break;
            }

            let now = self.update_now();
            self.drain_timers(now);
            self.drain_events();
            self.next_request();

            self.park().await;
        }

        if self.inner.done.fire() {
            info!(loop_id = %self.inner.id, "Loop finished");
        }
        self.release_queues();
    }

    /// Closes the loop to new work and frees everything still queued.
    ///
    /// Queued closures may hold handles to this loop, so keeping them would
    /// keep the loop alive forever.
    fn release_queues(&self) {
        let (requests, events, teardowns, timers) = {
            let mut state = self.inner.state.lock();
            state.locked = true;
            state.closed = true;
            (
                std::mem::take(&mut state.requests),
                std::mem::take(&mut state.events),
                std::mem::take(&mut state.teardowns),
                std::mem::take(&mut state.timers),
            )
        };

        let callbacks: Vec<_> = timers
            .iter()
            .map(|timer| {
                timer.entry.drop_timer();
                timer.entry.take_callback()
            })
            .collect();

        trace!(
            loop_id = %self.inner.id,
            requests = requests.len(),
            calls = events.len(),
            teardowns = teardowns.len(),
            timers = timers.len(),
            "Released queued work"
        );
        drop((requests, events, teardowns, timers, callbacks));
    }

    fn stop_sequence(&self) {
        let (timers, teardowns) = {
            let mut state = self.inner.state.lock();
            if state.locked {
                return;
            }
            (
                std::mem::take(&mut state.timers),
                std::mem::take(&mut state.teardowns),
            )
        };

        for timer in timers {
            timer.entry.drop_timer();
            drop(timer.entry.take_callback());
        }

        for teardown in teardowns {
            self.guarded("teardown", teardown);
        }

        for handler in self.handler_snapshot() {
            handler.stop();
        }

        self.inner.state.lock().locked = true;
        debug!(loop_id = %self.inner.id, "Loop locked");
    }

    fn update_now(&self) -> Instant {
        let now = Instant::now();
        self.inner.state.lock().now = now;
        now
    }

    fn drain_timers(&self, now: Instant) {
        let mut due = Vec::new();
        let mut stopped = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.timers.retain_mut(|timer| {
                if timer.entry.is_dropped() {
                    stopped.push(Arc::clone(&timer.entry));
                    return false;
                }
                if timer.next > now {
                    return true;
                }
                due.push(Arc::clone(&timer.entry));
                if timer.entry.repeat {
                    timer.next = now + timer.entry.delay;
                }
                // One-shots stay visible to `stop` until they have fired;
                // the next pass removes them.
                true
            });
        }

        for entry in stopped {
            drop(entry.take_callback());
        }

        for entry in due {
            self.guarded("timer", || entry.fire());
            if !entry.repeat {
                drop(entry.take_callback());
            }
        }
    }

    fn drain_events(&self) {
        let batch = std::mem::take(&mut self.inner.state.lock().events);

        for event in batch {
            if self.inner.shutdown.is_fired() {
                return;
            }
            self.guarded("call", event);
        }
    }

    fn next_teardown(&self) -> bool {
        let teardown = self.inner.state.lock().teardowns.pop_front();
        match teardown {
            Some(teardown) => {
                self.guarded("teardown", teardown);
                true
            }
            None => false,
        }
    }

    fn next_request(&self) {
        let (pending, handlers) = {
            let mut state = self.inner.state.lock();
            let Some(pending) = state.requests.pop_front() else {
                return;
            };
            let handlers = state.handlers.get(&pending.kind).cloned();
            (pending, handlers)
        };

        let PendingRequest {
            kind,
            request,
            callback,
        } = pending;

        let Some(handlers) = handlers.filter(|h| !h.is_empty()) else {
            error!(loop_id = %self.inner.id, %kind, "No handler registered for request");
            callback.invoke(Err(Error::UnknownRequestKind { kind }));
            return;
        };

        for handler in handlers {
            trace!(
                loop_id = %self.inner.id,
                %kind,
                handler = handler.name(),
                request = request.name(),
                "Dispatching request"
            );

            let dispatched = catch_unwind(AssertUnwindSafe(|| {
                handler.handle(self, request.clone(), callback.clone())
            }));

            match dispatched {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        loop_id = %self.inner.id,
                        %kind,
                        handler = handler.name(),
                        error = %e,
                        "Handler rejected request"
                    );
                    callback.invoke(Err(e));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        loop_id = %self.inner.id,
                        %kind,
                        handler = handler.name(),
                        panic = %message,
                        "Handler panicked"
                    );
                    callback.invoke(Err(Error::HandlerPanicked { kind, message }));
                }
            }
        }
    }

    async fn park(&self) {
        let deadline = {
            let state = self.inner.state.lock();
            if state.events.is_empty() && state.requests.is_empty() {
                let recheck = Instant::now() + self.inner.idle_recheck;
                let earliest = state
                    .timers
                    .iter()
                    .filter(|t| !t.entry.is_dropped())
                    .map(|t| t.next)
                    .min();
                Some(earliest.map_or(recheck, |next| next.min(recheck)))
            } else {
                None
            }
        };

        let Some(deadline) = deadline else {
            tokio::task::yield_now().await;
            return;
        };

        tokio::select! {
            () = self.inner.shutdown.wait() => {}
            () = self.inner.wake.notified() => {}
            () = tokio::time::sleep_until(deadline.into()) => {}
        }
    }

    /// Distinct registered handlers, collected outside the state lock.
    fn handler_snapshot(&self) -> Vec<Arc<dyn Handler>> {
        let state = self.inner.state.lock();
        let mut unique: Vec<Arc<dyn Handler>> = Vec::new();
        for handler in state.handlers.values().flatten() {
            if !unique.iter().any(|seen| Arc::ptr_eq(seen, handler)) {
                unique.push(Arc::clone(handler));
            }
        }
        unique
    }

    fn guarded<F: FnOnce()>(&self, what: &'static str, f: F) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            error!(
                loop_id = %self.inner.id,
                callback = what,
                panic = %panic_message(payload.as_ref()),
                "Callback panicked"
            );
        }
    }
}

impl Default for Loop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("id", &self.inner.id)
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// WeakLoop
// ============================================================================

/// Non-owning loop handle held by shared handlers and timers.
#[derive(Clone, Default)]
pub struct WeakLoop {
    inner: Weak<LoopInner>,
}

impl WeakLoop {
    /// Creates a handle that never upgrades.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the loop if it is still referenced.
    #[must_use]
    pub fn upgrade(&self) -> Option<Loop> {
        self.inner.upgrade().map(|inner| Loop { inner })
    }
}

impl fmt::Debug for WeakLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakLoop")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
