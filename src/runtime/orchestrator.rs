//! Fork orchestrator.
//!
//! Each instance owns a loop with its own client, delay and passthrough
//! handlers. The server handler is shared, so instances listening on one
//! address split its connections. The master (index 0) stays alive until
//! every fork has finished, then runs its own teardown.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ev::{Callback, Handler, Loop, Request, RequestKind};
use crate::handlers::{ClientHandler, DelayHandler, PassthroughHandler, ServerHandler};
use crate::stats::{Statistics, Summary};
use crate::sync::{Signal, WaitGroup};

use super::context::Context;
use super::script::{Script, ScriptFactory};

/// Kind under which the master registers its fork supervisor.
const SUPERVISOR: RequestKind = RequestKind::new(u16::MAX);

// ============================================================================
// Supervisor
// ============================================================================

/// Keeps the master loop active while forks are running.
struct Supervisor {
    children: WaitGroup,
}

impl Handler for Supervisor {
    fn name(&self) -> &'static str {
        "supervisor"
    }

    fn handle(&self, _ev: &Loop, request: Request, _callback: Callback) -> Result<()> {
        Err(Error::unsupported_request(self.name(), request.name()))
    }

    fn is_active(&self, _ev: &Loop) -> bool {
        self.children.count() > 0
    }

    fn stop(&self) {}
}

// ============================================================================
// RuntimeInner
// ============================================================================

pub(crate) struct RuntimeInner {
    config: Config,
    stats: Statistics,
    factory: ScriptFactory,
    server: Arc<ServerHandler>,
    instances: WaitGroup,
    children: WaitGroup,
    next_index: AtomicUsize,
    started: AtomicBool,
    soft: Signal,
    hard: Signal,
    master: Mutex<Option<Loop>>,
}

impl RuntimeInner {
    /// Launches instance `index + 1` from the master.
    pub(super) fn fork(self: &Arc<Self>) -> Result<usize> {
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        self.launch(index)?;
        info!(instance = index, "Instance forked");
        Ok(index)
    }

    fn launch(self: &Arc<Self>, index: usize) -> Result<()> {
        let ev = Loop::with_idle_recheck(self.config.idle_recheck);
        ev.register(
            RequestKind::WS_CLIENT,
            Arc::new(ClientHandler::new(self.config.dial.clone())),
        )?;
        ev.register(RequestKind::WS_SERVER, self.server.clone())?;
        ev.register(RequestKind::DELAY, Arc::new(DelayHandler::new()))?;
        ev.register(RequestKind::PASSTHROUGH, Arc::new(PassthroughHandler::new()))?;
        if index == 0 {
            ev.register(
                SUPERVISOR,
                Arc::new(Supervisor {
                    children: self.children.clone(),
                }),
            )?;
        }

        let ctx = Context::new(
            index,
            ev.clone(),
            self.stats.clone(),
            &self.config,
            Arc::downgrade(self),
        );
        let script: Arc<Mutex<Box<dyn Script>>> = Arc::new(Mutex::new((self.factory)()));

        {
            let script = Arc::clone(&script);
            let ctx = ctx.clone();
            ev.call(move || {
                if let Err(e) = script.lock().main(&ctx) {
                    error!(instance = index, error = %e, "Script main failed");
                }
            });
        }
        {
            let ctx = ctx.clone();
            ev.teardown(move || {
                script.lock().done(&ctx);
                ctx.emit("exit", Value::Null);
            });
        }

        ev.run()?;

        self.instances.add();
        if index == 0 {
            *self.master.lock() = Some(ev.clone());
        } else {
            self.children.add();
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.watch(index, &ev).await;
            ctx.clear_listeners();

            if index > 0 {
                inner.children.done();
                if let Some(master) = inner.master.lock().as_ref() {
                    master.wake();
                }
            }
            inner.instances.done();
        });

        debug!(instance = index, "Instance launched");
        Ok(())
    }

    /// Waits for `ev` to finish, forwarding soft and hard stops.
    async fn watch(&self, index: usize, ev: &Loop) {
        tokio::select! {
            () = ev.done() => {}
            () = self.soft.wait() => {
                ev.stop();
                tokio::select! {
                    () = ev.done() => {}
                    () = self.hard.wait() => ev.shutdown(),
                }
            }
            () = self.hard.wait() => ev.shutdown(),
        }
        info!(instance = index, loop_id = %ev.id(), "Instance finished");
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Runs a master script and the forks it launches.
///
/// Cloning shares the runtime.
///
/// # Example
///
/// ```no_run
/// use wsev::config::Config;
/// use wsev::runtime::{Context, Runtime, Script};
/// use wsev::stats::Statistics;
///
/// struct Hello;
///
/// impl Script for Hello {
///     fn main(&mut self, ctx: &Context) -> wsev::Result<()> {
///         if ctx.is_master() {
///             ctx.fork()?;
///         }
///         Ok(())
///     }
/// }
///
/// # async fn demo() -> wsev::Result<()> {
/// let runtime = Runtime::new(Config::new(), Statistics::new(), || Box::new(Hello));
/// let summary = runtime.run().await?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime; `factory` builds one script per instance.
    pub fn new<F>(config: Config, stats: Statistics, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                stats,
                factory: Box::new(factory),
                server: Arc::new(ServerHandler::new()),
                instances: WaitGroup::new(),
                children: WaitGroup::new(),
                next_index: AtomicUsize::new(1),
                started: AtomicBool::new(false),
                soft: Signal::new(),
                hard: Signal::new(),
                master: Mutex::new(None),
            }),
        }
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the shared statistics.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &Statistics {
        &self.inner.stats
    }

    /// Returns the number of running instances.
    #[inline]
    #[must_use]
    pub fn instances(&self) -> usize {
        self.inner.instances.count()
    }

    /// Launches the master instance.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid or no tokio
    ///   runtime is available
    /// - [`Error::AlreadyRunning`] on a second call
    pub fn start(&self) -> Result<()> {
        self.inner.config.validate()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        self.inner.launch(0)?;
        info!("Runtime started");
        Ok(())
    }

    /// Asks every instance to stop gracefully.
    pub fn stop(&self) {
        if self.inner.soft.fire() {
            info!(instances = self.instances(), "Stopping softly");
        }
    }

    /// Forces every instance to finish now.
    pub fn shutdown(&self) {
        if self.inner.hard.fire() {
            warn!(instances = self.instances(), "Stopping hard");
        }
    }

    /// Stops softly, then hard if instances remain after `grace`.
    pub async fn terminate(&self, grace: Duration) {
        self.stop();
        if timeout(grace, self.inner.instances.wait()).await.is_err() {
            warn!(?grace, "Grace period expired");
            self.shutdown();
        }
    }

    /// Maps Ctrl-C to shutdown: the first interrupt stops softly, a second
    /// one or expiry of `grace` stops hard.
    pub fn watch_signals(&self, grace: Duration) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("Interrupt received");
            runtime.stop();

            tokio::select! {
                () = runtime.inner.instances.wait() => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Second interrupt received");
                    runtime.shutdown();
                }
                () = sleep(grace) => {
                    warn!(?grace, "Grace period expired");
                    runtime.shutdown();
                }
            }
        })
    }

    /// Logs a statistics summary every `stat_interval` until all instances
    /// finish.
    ///
    /// Each report flushes the counters, restarting their rate windows.
    pub fn report_stats(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(runtime.inner.config.stat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = runtime.inner.instances.wait() => return,
                    _ = ticker.tick() => {
                        let summary = runtime.inner.stats.flush();
                        if !summary.is_empty() {
                            info!(summary = %summary, "Statistics");
                        }
                    }
                }
            }
        })
    }

    /// Waits for every instance to finish and returns the final summary.
    ///
    /// Resolves immediately if nothing was started.
    pub async fn wait(&self) -> Summary {
        self.inner.instances.wait().await;
        self.inner.stats.flush()
    }

    /// Starts the runtime, handles Ctrl-C with the configured grace period
    /// and waits for completion.
    ///
    /// # Errors
    ///
    /// Returns the error from [`Runtime::start`].
    pub async fn run(&self) -> Result<Summary> {
        self.start()?;
        let signals = self.watch_signals(self.inner.config.grace);
        let summary = self.wait().await;
        signals.abort();
        Ok(summary)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("instances", &self.instances())
            .field("stopping", &self.inner.soft.is_fired())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
