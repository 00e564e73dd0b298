//! WebSocket transport layer.
//!
//! Bridges raw duplex sockets into the loop's request model.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   send_async    ┌─────────────┐
//! │   callers    │ ──────────────► │ writer task │ ──► socket sink
//! │ (any task)   │   receive_async ├─────────────┤
//! │              │ ──────────────► │ reader task │ ◄── socket stream
//! └──────────────┘  oneshot reply  └─────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Serialized concurrent send/receive over one socket |
//! | `dial` | Client handshake |
//! | `message` | Message and frame kinds |
//! | `origin` | `Origin` glob matching |
//! | `responder` | Echo, mirror and devnull replies |
//! | `server` | Listener shared between loops |

// ============================================================================
// Submodules
// ============================================================================

/// Duplex connection with I/O workers.
pub mod connection;

/// Client dialing.
pub mod dial;

/// Message types.
pub mod message;

/// Origin glob patterns.
pub mod origin;

/// Server reply strategies.
pub mod responder;

/// Shared listener.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use dial::dial;
pub use message::{Message, MessageKind};
pub use origin::OriginPattern;
pub use responder::{Responder, respond};
pub use server::{Server, ServerConfig, Subscriber};
