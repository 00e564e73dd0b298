//! Event loop core.
//!
//! A [`Loop`] multiplexes requests, deferred calls, timers and teardown
//! callbacks onto one scheduler task. [`Handler`]s service requests by
//! spawning background work that reports back through [`Loop::call`].
//!
//! # Lifecycle
//!
//! ```text
//! running --stop()--> locked --idle--> teardowns --> done
//!    |                                                 ^
//!    +-------------------shutdown()--------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> wsev::Result<()> {
//! use std::sync::Arc;
//! use serde_json::json;
//! use wsev::ev::{Callback, Loop, Request, RequestKind};
//! use wsev::handlers::PassthroughHandler;
//!
//! let ev = Loop::new();
//! ev.register(RequestKind::PASSTHROUGH, Arc::new(PassthroughHandler::new()))?;
//! ev.request(
//!     RequestKind::PASSTHROUGH,
//!     Request::Value(json!("hello")),
//!     Callback::new(|result| println!("{result:?}")),
//! );
//! ev.run()?;
//! ev.done().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Scheduler and loop handles.
pub mod event_loop;

/// Handler protocol.
pub mod handler;

/// Request payloads and outcomes.
pub mod request;

/// Loop-owned timers.
pub mod timer;

// ============================================================================
// Re-exports
// ============================================================================

pub use event_loop::{DEFAULT_IDLE_RECHECK, Loop, WeakLoop};
pub use handler::{Callback, Handler, PendingGuard, RequestKind};
pub use request::{Connect, Delay, Outcome, Outgoing, Receive, Request};
pub use timer::TimerHandle;
