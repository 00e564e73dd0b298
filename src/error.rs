//! Error types for the event loop and WebSocket toolkit.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsev::{Error, Result};
//!
//! fn on_message(result: Result<Outcome>) {
//!     match result {
//!         Err(e) if e.is_end_of_stream() => println!("peer closed"),
//!         Err(e) => println!("failure: {e}"),
//!         Ok(outcome) => println!("{outcome:?}"),
//!     }
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidDuration`], [`Error::InvalidHeader`], [`Error::InvalidOrigin`] |
//! | Listen | [`Error::ListenConflict`], [`Error::AlreadyListening`], [`Error::Listen`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Programming | [`Error::AlreadyRunning`], [`Error::AlreadyClosed`], [`Error::HandlerAlreadyRegistered`] |
//! | Dispatch | [`Error::UnknownRequestKind`], [`Error::UnsupportedRequest`], [`Error::HandlerPanicked`] |
//! | Runtime | [`Error::Runtime`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::ev::RequestKind;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a configuration value is invalid or missing.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Duration string could not be parsed.
    #[error("Invalid duration: {input:?}")]
    InvalidDuration {
        /// The rejected input.
        input: String,
    },

    /// Header string could not be parsed.
    #[error("Invalid header: {message}")]
    InvalidHeader {
        /// Description of the malformed header.
        message: String,
    },

    /// Origin glob pattern could not be compiled.
    #[error("Invalid origin pattern {pattern:?}: {message}")]
    InvalidOrigin {
        /// The rejected pattern.
        pattern: String,
        /// Reason the pattern was rejected.
        message: String,
    },

    // ========================================================================
    // Listen Errors
    // ========================================================================
    /// Address is already bound with a different configuration.
    #[error("Already listening on {addr} with different configuration")]
    ListenConflict {
        /// The contested address.
        addr: String,
    },

    /// Address is already bound by the same loop.
    #[error("Already listening on {addr} in current loop")]
    AlreadyListening {
        /// The contested address.
        addr: String,
    },

    /// Listener failed or ended.
    ///
    /// Delivered to every loop subscribed to the listener.
    #[error("Listener on {addr} ended: {message}")]
    Listen {
        /// Listener address.
        addr: String,
        /// Reason the listener ended.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    ///
    /// Returned when dialing or upgrading fails.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Dial did not complete in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// End of stream: the connection was closed.
    ///
    /// Distinct from transport failures so callers can tell a clean close
    /// from a network error.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Programming Errors
    // ========================================================================
    /// `Loop::run` was called twice.
    #[error("Loop is already running")]
    AlreadyRunning,

    /// `Connection::close` was called twice.
    #[error("Connection already closed")]
    AlreadyClosed,

    /// A single-loop handler was registered in a second loop.
    #[error("Handler {handler} could be registered only in one loop")]
    HandlerAlreadyRegistered {
        /// Handler name.
        handler: &'static str,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No handler is registered for the request kind.
    #[error("No handler registered for request kind {kind}")]
    UnknownRequestKind {
        /// The unhandled kind.
        kind: RequestKind,
    },

    /// Handler received a request it does not service.
    #[error("Unknown request format to {handler} handler: {request}")]
    UnsupportedRequest {
        /// Handler name.
        handler: &'static str,
        /// Request variant name.
        request: &'static str,
    },

    /// Handler panicked while dispatching a request.
    #[error("Handler for request kind {kind} panicked: {message}")]
    HandlerPanicked {
        /// Kind being dispatched.
        kind: RequestKind,
        /// Panic payload, if it was a string.
        message: String,
    },

    // ========================================================================
    // Runtime Errors
    // ========================================================================
    /// Runtime orchestration error.
    #[error("Runtime error: {message}")]
    Runtime {
        /// Description of the runtime error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Conversions
// ============================================================================

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            other => Self::WebSocket(other),
        }
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid duration error.
    #[inline]
    pub fn invalid_duration(input: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
        }
    }

    /// Creates an invalid header error.
    #[inline]
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Creates an invalid origin pattern error.
    #[inline]
    pub fn invalid_origin(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOrigin {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Creates a listen conflict error.
    #[inline]
    pub fn listen_conflict(addr: impl Into<String>) -> Self {
        Self::ListenConflict { addr: addr.into() }
    }

    /// Creates an already listening error.
    #[inline]
    pub fn already_listening(addr: impl Into<String>) -> Self {
        Self::AlreadyListening { addr: addr.into() }
    }

    /// Creates a listener failure error.
    #[inline]
    pub fn listen(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Listen {
            addr: addr.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an unsupported request error.
    #[inline]
    pub fn unsupported_request(handler: &'static str, request: &'static str) -> Self {
        Self::UnsupportedRequest { handler, request }
    }

    /// Creates a runtime error.
    #[inline]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the peer closed the connection.
    #[inline]
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns `true` if this is a transport failure.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Listen { .. }
                | Self::WebSocket(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` if this error was detected before any I/O started.
    #[inline]
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidDuration { .. }
                | Self::InvalidHeader { .. }
                | Self::InvalidOrigin { .. }
                | Self::ListenConflict { .. }
                | Self::AlreadyListening { .. }
        )
    }

    /// Returns `true` if this error indicates a caller bug.
    #[inline]
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning
                | Self::AlreadyClosed
                | Self::HandlerAlreadyRegistered { .. }
                | Self::UnsupportedRequest { .. }
                | Self::HandlerPanicked { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed when the request is issued again.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionTimeout { .. } | Self::Io(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
