//! Request handlers.
//!
//! | Handler | Kind | Requests |
//! |---------|------|----------|
//! | [`ClientHandler`] | `WS_CLIENT` | `Connect`, `Send`, `Receive` |
//! | [`ServerHandler`] | `WS_SERVER` | `Listen` |
//! | [`DelayHandler`] | `DELAY` | `Delay` |
//! | [`PassthroughHandler`] | `PASSTHROUGH` | `Value` |
//!
//! Handlers launch their blocking work on tokio tasks and report back via
//! [`Loop::call`](crate::ev::Loop::call).

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket client operations.
pub mod client;

/// Timer handler.
pub mod delay;

/// Identity handler.
pub mod passthrough;

/// Shared listeners.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::ClientHandler;
pub use delay::DelayHandler;
pub use passthrough::PassthroughHandler;
pub use server::ServerHandler;
