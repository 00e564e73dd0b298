//! Script-facing API of one runtime instance.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ev::{Callback, Connect, Delay, Loop, Outcome, Outgoing, Receive, Request, RequestKind, TimerHandle};
use crate::identifiers::{InstanceId, SubscriptionId};
use crate::stats::Statistics;
use crate::ws::{Connection, Message, ServerConfig};

use super::emitter::Emitter;
use super::orchestrator::RuntimeInner;
use super::storage::Storage;

// ============================================================================
// Context
// ============================================================================

/// Handle given to a [`Script`](super::Script) and captured by its
/// callbacks. Cloning shares the instance.
///
/// Every request helper enqueues onto the instance's loop and reports back
/// on the loop's scheduler task.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    index: usize,
    instance_id: InstanceId,
    ev: Loop,
    stats: Statistics,
    emitter: Mutex<Emitter>,
    storage: Storage,
    config: Config,
    runtime: Weak<RuntimeInner>,
}

impl Context {
    /// Creates the context of instance `index`, seeding storage with
    /// `url`, `listen`, `headers` and `id`.
    pub(super) fn new(
        index: usize,
        ev: Loop,
        stats: Statistics,
        config: &Config,
        runtime: Weak<RuntimeInner>,
    ) -> Self {
        let storage = Storage::new();
        storage.set("url", config.url.clone());
        storage.set("listen", config.listen.clone());
        storage.set("headers", headers_to_json(config));
        storage.set("id", index);

        Self {
            inner: Arc::new(ContextInner {
                index,
                instance_id: InstanceId::generate(),
                ev,
                stats,
                emitter: Mutex::new(Emitter::new()),
                storage,
                config: config.clone(),
                runtime,
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the instance index; the master is `0`.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Returns the unique instance ID.
    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// Returns `true` for the master instance.
    #[inline]
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.inner.index == 0
    }

    /// Returns the instance's loop.
    #[inline]
    #[must_use]
    pub fn event_loop(&self) -> &Loop {
        &self.inner.ev
    }

    /// Returns the statistics shared by all instances.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &Statistics {
        &self.inner.stats
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Adds a listener for `event`.
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.emitter.lock().on(event, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if `id` was unknown.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.emitter.lock().off(id)
    }

    /// Emits `event` with `payload` on the loop.
    ///
    /// Listeners run later, from the scheduler task. Dropped if the loop is
    /// locked.
    pub fn emit(&self, event: impl Into<String>, payload: Value) {
        let ctx = self.clone();
        let event = event.into();
        self.inner.ev.call(move || ctx.dispatch(&event, &payload));
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let listeners = self.inner.emitter.lock().listeners(event);
        debug!(
            instance = self.inner.index,
            event,
            listeners = listeners.len(),
            "Emitting event"
        );
        for listener in listeners {
            listener(payload);
        }
    }

    /// Drops every listener, releasing what they captured.
    pub(super) fn clear_listeners(&self) {
        *self.inner.emitter.lock() = Emitter::new();
    }

    // ========================================================================
    // Storage
    // ========================================================================

    /// Stores `value` under `key`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.storage.set(key, value);
    }

    /// Returns the value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.storage.get(key)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Dials a server.
    pub fn connect<F>(&self, connect: Connect, mut f: F)
    where
        F: FnMut(Result<Connection>) + Send + 'static,
    {
        self.inner.ev.request(
            RequestKind::WS_CLIENT,
            Request::Connect(connect),
            Callback::new(move |result| f(result.and_then(expect_connection))),
        );
    }

    /// Dials the configured URL with the configured headers, filling in
    /// `Origin` when absent.
    pub fn connect_default<F>(&self, f: F)
    where
        F: FnMut(Result<Connection>) + Send + 'static,
    {
        match self.inner.config.dial_target() {
            Ok((url, headers)) => {
                self.connect(Connect::new(url.as_str()).with_headers(headers), f);
            }
            Err(e) => {
                let mut f = f;
                self.inner.ev.call(move || f(Err(e)));
            }
        }
    }

    /// Listens for connections; `f` runs once per accepted connection.
    pub fn listen<F>(&self, config: ServerConfig, mut f: F)
    where
        F: FnMut(Result<Connection>) + Send + 'static,
    {
        self.inner.ev.request(
            RequestKind::WS_SERVER,
            Request::Listen(config),
            Callback::new(move |result| f(result.and_then(expect_connection))),
        );
    }

    /// Writes `message` to `conn`.
    pub fn send<F>(&self, conn: &Connection, message: Message, mut f: F)
    where
        F: FnMut(Result<()>) + Send + 'static,
    {
        self.inner.ev.request(
            RequestKind::WS_CLIENT,
            Request::Send(Outgoing::new(conn.clone(), message)),
            Callback::new(move |result| f(result.map(|_| ()))),
        );
    }

    /// Subscribes to messages on `conn`; `f` runs once per message and a
    /// final time with the error that ended the subscription.
    ///
    /// The returned handle cancels the subscription.
    pub fn receive<F>(&self, conn: &Connection, mut f: F) -> Receive
    where
        F: FnMut(Result<Message>) + Send + 'static,
    {
        let receive = Receive::new(conn.clone());
        self.inner.ev.request(
            RequestKind::WS_CLIENT,
            Request::Receive(receive.clone()),
            Callback::new(move |result: Result<Outcome>| {
                f(result.and_then(|outcome| {
                    outcome
                        .into_message()
                        .ok_or_else(|| Error::runtime("receive produced a non-message outcome"))
                }));
            }),
        );
        receive
    }

    /// Runs `delay` on the delay handler. The returned copy stops it.
    pub fn delay<F>(&self, delay: Delay, mut f: F) -> Delay
    where
        F: FnMut(Result<()>) + Send + 'static,
    {
        let ticket = delay.clone();
        self.inner.ev.request(
            RequestKind::DELAY,
            Request::Delay(delay),
            Callback::new(move |result| f(result.map(|_| ()))),
        );
        ticket
    }

    /// Runs `f` once after `delay`, on the loop clock.
    pub fn set_timeout<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.ev.timeout(delay, false, f)
    }

    /// Runs `f` every `interval` until the handle is stopped.
    pub fn set_interval<F>(&self, interval: Duration, f: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.ev.timeout(interval, true, f)
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Launches another instance running a fresh script.
    ///
    /// Returns the new instance's index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when called from a forked instance or
    /// after the runtime was dropped.
    pub fn fork(&self) -> Result<usize> {
        if !self.is_master() {
            return Err(Error::runtime("fork is only available on the master instance"));
        }
        let runtime = self
            .inner
            .runtime
            .upgrade()
            .ok_or_else(|| Error::runtime("runtime is no longer available"))?;
        runtime.fork()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("index", &self.inner.index)
            .field("instance_id", &self.inner.instance_id)
            .field("loop_id", &self.inner.ev.id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn expect_connection(outcome: Outcome) -> Result<Connection> {
    outcome
        .into_connection()
        .ok_or_else(|| Error::runtime("expected a connection outcome"))
}

fn headers_to_json(config: &Config) -> Value {
    let mut map = Map::new();
    for (name, value) in &config.headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), Value::from(value));
        }
    }
    Value::Object(map)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    const WAIT: Duration = Duration::from_secs(3);

    fn detached(index: usize, config: &Config) -> Context {
        Context::new(index, Loop::new(), Statistics::new(), config, Weak::new())
    }

    #[test]
    fn test_storage_seeded() {
        let mut config = Config::new().with_url("ws://example.com:9001");
        config
            .headers
            .insert("x-token", HeaderValue::from_static("abc"));

        let ctx = detached(2, &config);
        assert_eq!(ctx.get("url"), Some(json!("ws://example.com:9001")));
        assert_eq!(ctx.get("listen"), Some(json!(":3000")));
        assert_eq!(ctx.get("headers"), Some(json!({"x-token": "abc"})));
        assert_eq!(ctx.get("id"), Some(json!(2)));

        ctx.set("id", "custom");
        assert_eq!(ctx.get("id"), Some(json!("custom")));
    }

    #[test]
    fn test_fork_rejected_off_master() {
        let ctx = detached(1, &Config::new());
        assert!(!ctx.is_master());
        assert!(matches!(ctx.fork(), Err(Error::Runtime { .. })));

        let master = detached(0, &Config::new());
        assert!(matches!(master.fork(), Err(Error::Runtime { .. })));
    }

    #[tokio::test]
    async fn test_emit_runs_on_loop() {
        let ctx = detached(0, &Config::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let sub = ctx.on("ping", move |payload| {
            assert_eq!(payload, &json!({"n": 1}));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&hits);
        let removed = ctx.on("ping", move |_| {
            counter.fetch_add(100, Ordering::SeqCst);
        });
        assert!(ctx.off(removed));

        ctx.emit("ping", json!({"n": 1}));
        ctx.emit("unheard", Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        ctx.event_loop().run().unwrap();
        timeout(WAIT, ctx.event_loop().done()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ctx.off(sub));
    }

    #[tokio::test]
    async fn test_set_interval_until_stopped() {
        let ctx = detached(0, &Config::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(Mutex::new(None::<TimerHandle>));

        let counter = Arc::clone(&hits);
        let slot = Arc::clone(&handle);
        let timer = ctx.set_interval(Duration::from_millis(5), move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(timer) = slot.lock().as_ref() {
                    timer.stop();
                }
            }
        });
        *handle.lock() = Some(timer);

        ctx.event_loop().run().unwrap();
        timeout(WAIT, ctx.event_loop().done()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
