//! Request payloads and callback outcomes.
//!
//! Payloads form one closed sum type so every handler matches them
//! exhaustively. Each handler family services a subset and rejects the
//! rest with [`Error::UnsupportedRequest`](crate::Error::UnsupportedRequest).
//!
//! | Variant | Serviced by | Outcome(s) |
//! |---------|-------------|------------|
//! | `Connect` | `ClientHandler` | one `Connected` |
//! | `Send` | `ClientHandler` | one `Sent` |
//! | `Receive` | `ClientHandler` | `Message` per frame |
//! | `Listen` | `ServerHandler` | `Accepted` per connection |
//! | `Delay` | `DelayHandler` | `Elapsed` per fire |
//! | `Value` | `PassthroughHandler` | one `Value` |

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_tungstenite::tungstenite::http::HeaderMap;

use crate::sync::Signal;
use crate::ws::{Connection, Message, ServerConfig};

// ============================================================================
// Payloads
// ============================================================================

/// Dial a WebSocket server.
#[derive(Debug, Clone)]
pub struct Connect {
    /// Target URL (`ws://host:port/path`).
    pub url: String,
    /// Headers sent with the upgrade request.
    pub headers: HeaderMap,
}

impl Connect {
    /// Creates a connect request without extra headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Sets handshake headers.
    #[inline]
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Write one message to a connection.
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// Target connection.
    pub conn: Connection,
    /// Message to write.
    pub message: Message,
}

impl Outgoing {
    /// Creates a send request.
    #[must_use]
    pub fn new(conn: Connection, message: Message) -> Self {
        Self { conn, message }
    }
}

/// Subscribe to messages arriving on a connection.
///
/// The subscription lasts until the connection closes, a read fails, the
/// handler stops, or [`Receive::cancel`] is called.
#[derive(Debug, Clone)]
pub struct Receive {
    conn: Connection,
    cancel: Signal,
}

impl Receive {
    /// Creates a receive subscription.
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            cancel: Signal::new(),
        }
    }

    /// Returns the subscribed connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Ends the subscription without closing the connection.
    ///
    /// A message already being read for this subscription is kept for the
    /// next [`Connection::receive`] caller.
    pub fn cancel(&self) {
        self.cancel.fire();
    }

    /// Returns the cancellation signal.
    #[inline]
    #[must_use]
    pub fn cancel_signal(&self) -> &Signal {
        &self.cancel
    }
}

/// Handler-driven timer.
///
/// Clones share the same stop ticket.
#[derive(Debug, Clone)]
pub struct Delay {
    /// Time until (each) fire.
    pub delay: Duration,
    /// Fire repeatedly until stopped.
    pub repeat: bool,
    ticket: Signal,
}

impl Delay {
    /// Fires once after `delay`.
    #[must_use]
    pub fn once(delay: Duration) -> Self {
        Self {
            delay,
            repeat: false,
            ticket: Signal::new(),
        }
    }

    /// Fires every `delay` until stopped.
    #[must_use]
    pub fn ticker(delay: Duration) -> Self {
        Self {
            delay,
            repeat: true,
            ticket: Signal::new(),
        }
    }

    /// Stops future fires.
    pub fn stop(&self) {
        self.ticket.fire();
    }

    /// Returns `true` once stopped.
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.ticket.is_fired()
    }

    /// Returns the stop ticket.
    #[inline]
    #[must_use]
    pub fn ticket(&self) -> &Signal {
        &self.ticket
    }
}

// ============================================================================
// Request
// ============================================================================

/// A unit of work submitted to a loop.
#[derive(Debug, Clone)]
pub enum Request {
    /// Dial a server.
    Connect(Connect),
    /// Write a message.
    Send(Outgoing),
    /// Subscribe to incoming messages.
    Receive(Receive),
    /// Accept connections on an address.
    Listen(ServerConfig),
    /// Handler-driven timer.
    Delay(Delay),
    /// Echoed back unchanged.
    Value(Value),
}

impl Request {
    /// Returns the variant name, used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Send(_) => "send",
            Self::Receive(_) => "receive",
            Self::Listen(_) => "listen",
            Self::Delay(_) => "delay",
            Self::Value(_) => "value",
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Successful result delivered to a [`Callback`](super::Callback).
#[derive(Debug)]
pub enum Outcome {
    /// Dial succeeded.
    Connected(Connection),
    /// Message written.
    Sent,
    /// Message received on a subscription.
    Message(Message),
    /// Listener accepted a connection.
    Accepted(Connection),
    /// Delay fired.
    Elapsed(Instant),
    /// Passthrough value.
    Value(Value),
}

impl Outcome {
    /// Returns the connection from `Connected` or `Accepted`.
    #[must_use]
    pub fn into_connection(self) -> Option<Connection> {
        match self {
            Self::Connected(conn) | Self::Accepted(conn) => Some(conn),
            _ => None,
        }
    }

    /// Returns the message from `Message`.
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_request_names() {
        assert_eq!(Request::Value(json!(null)).name(), "value");
        assert_eq!(Request::Connect(Connect::new("ws://x")).name(), "connect");
        assert_eq!(
            Request::Delay(Delay::once(Duration::from_millis(1))).name(),
            "delay"
        );
    }

    #[test]
    fn test_delay_clones_share_ticket() {
        let delay = Delay::ticker(Duration::from_millis(5));
        let copy = delay.clone();
        assert!(copy.repeat);

        delay.stop();
        assert!(copy.is_stopped());
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = Outcome::Message(Message::text("hi"));
        assert_eq!(
            outcome.into_message().and_then(|m| m.into_text()).as_deref(),
            Some("hi")
        );
        assert!(Outcome::Sent.into_connection().is_none());
    }
}
