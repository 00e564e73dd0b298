//! Canned server-side reply strategies.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::connection::Connection;
use super::message::{Message, MessageKind};

// ============================================================================
// Responder
// ============================================================================

/// How a server answers each incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Responder {
    /// Swallow everything.
    DevNull,
    /// Send the message back unchanged.
    #[default]
    Echo,
    /// Send text back reversed; ignore binary.
    Mirror,
}

impl Responder {
    /// Computes the reply to `message`, if any.
    #[must_use]
    pub fn reply(self, message: &Message) -> Option<Message> {
        match self {
            Self::DevNull => None,
            Self::Echo => Some(message.clone()),
            Self::Mirror => {
                if message.kind != MessageKind::Text {
                    return None;
                }
                let text = String::from_utf8_lossy(&message.data);
                Some(Message::text(text.chars().rev().collect::<String>()))
            }
        }
    }
}

impl FromStr for Responder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "devnull" | "null" => Ok(Self::DevNull),
            "echo" => Ok(Self::Echo),
            "mirror" => Ok(Self::Mirror),
            other => Err(Error::config(format!("Unknown responder {other:?}"))),
        }
    }
}

impl fmt::Display for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DevNull => "devnull",
            Self::Echo => "echo",
            Self::Mirror => "mirror",
        })
    }
}

// ============================================================================
// respond
// ============================================================================

/// Answers messages on `conn` until the peer goes away.
///
/// Returns `Ok(())` when the peer closes cleanly.
///
/// # Errors
///
/// Returns the first read or write failure other than end of stream.
pub async fn respond(conn: &Connection, responder: Responder) -> Result<()> {
    loop {
        let message = match conn.receive().await {
            Ok(message) => message,
            Err(e) if e.is_end_of_stream() => {
                debug!(conn_id = %conn.id(), "Peer closed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        trace!(conn_id = %conn.id(), %message, "Received");

        if let Some(reply) = responder.reply(&message) {
            conn.send(reply).await?;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
