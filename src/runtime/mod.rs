//! Script runtime: instances, forks and shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Runtime::start ──► master (index 0) ──fork──► instance 1..N
//!                        │                         │
//!                        │   Script::main on loop  │
//!                        ▼                         ▼
//!                   idle + forks done          idle
//!                        │                         │
//!                   Script::done, "exit"      Script::done, "exit"
//! ```
//!
//! `Runtime::stop` stops every loop softly; `Runtime::shutdown` forces
//! them done. `Runtime::terminate` chains the two around a grace period.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `context` | Script API: events, storage, requests, timers, fork |
//! | `emitter` | Named listeners keyed by [`SubscriptionId`](crate::identifiers::SubscriptionId) |
//! | `orchestrator` | [`Runtime`] |
//! | `script` | [`Script`] trait |
//! | `storage` | Per-instance JSON storage |

// ============================================================================
// Submodules
// ============================================================================

/// Script-facing context.
pub mod context;

/// Event listeners.
pub mod emitter;

/// Fork orchestrator.
pub mod orchestrator;

/// Script trait.
pub mod script;

/// Instance storage.
pub mod storage;

// ============================================================================
// Re-exports
// ============================================================================

pub use context::Context;
pub use emitter::{Emitter, Listener};
pub use orchestrator::Runtime;
pub use script::{Script, ScriptFactory};
pub use storage::Storage;
