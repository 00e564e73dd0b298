//! wsev - cooperative event loop and WebSocket toolkit.
//!
//! This library drives scripted WebSocket traffic from a single-task
//! scheduler: every user callback runs on the loop's own task, while
//! blocking network work runs on tokio tasks that report back through
//! [`ev::Loop::call`].
//!
//! # Architecture
//!
//! - **Loop**: FIFO requests, deferred calls, timers and teardowns, with a
//!   graceful `stop` and an immediate `shutdown`
//! - **Handlers**: per request kind; launch work asynchronously and track
//!   in-flight operations so the loop knows when it is idle
//! - **Connection**: one writer and one reader task per socket, so any
//!   number of concurrent senders and receivers share it safely
//! - **Runtime**: a master script forks independent instances that share
//!   statistics and listeners
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use wsev::ev::{Callback, Connect, Loop, Request, RequestKind};
//! use wsev::handlers::ClientHandler;
//! use wsev::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let ev = Loop::new();
//!     ev.register(RequestKind::WS_CLIENT, Arc::new(ClientHandler::default()))?;
//!
//!     ev.request(
//!         RequestKind::WS_CLIENT,
//!         Request::Connect(Connect::new("ws://localhost:9001")),
//!         Callback::new(|result| match result {
//!             Ok(outcome) => println!("connected: {:?}", outcome.into_connection()),
//!             Err(e) => eprintln!("connect failed: {e}"),
//!         }),
//!     );
//!
//!     ev.run()?;
//!     ev.done().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Settings and duration/header/URL parsing |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`ev`] | Event loop, handler trait, requests and timers |
//! | [`handlers`] | Client, server, delay and passthrough handlers |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`runtime`] | Script runtime with fork and two-stage shutdown |
//! | [`stats`] | Shared counters |
//! | [`sync`] | One-shot signal and wait group |
//! | [`ws`] | WebSocket connection, dialing and listening |

// ============================================================================
// Modules
// ============================================================================

/// Configuration and parsing helpers.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Event loop.
///
/// Start with [`ev::Loop`].
pub mod ev;

/// Request handlers.
pub mod handlers;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Script runtime.
pub mod runtime;

/// Statistics registry.
pub mod stats;

/// Synchronization primitives.
pub mod sync;

/// WebSocket transport layer.
pub mod ws;

// ============================================================================
// Re-exports
// ============================================================================

// Core types
pub use ev::{Callback, Handler, Loop, Outcome, Request, RequestKind};

// Configuration
pub use config::{Config, DialConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, InstanceId, LoopId, SubscriptionId};

// Transport types
pub use ws::{Connection, Message, MessageKind};
