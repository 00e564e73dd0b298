//! WebSocket messages as seen by handlers and scripts.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

// ============================================================================
// MessageKind
// ============================================================================

/// WebSocket frame opcode of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    /// UTF-8 text.
    Text,
    /// Opaque bytes.
    Binary,
    /// Close frame.
    Close,
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
}

impl MessageKind {
    /// Returns the RFC 6455 opcode.
    #[inline]
    #[must_use]
    pub const fn opcode(self) -> u8 {
        match self {
            Self::Text => 1,
            Self::Binary => 2,
            Self::Close => 8,
            Self::Ping => 9,
            Self::Pong => 10,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "TextMessage",
            Self::Binary => "BinaryMessage",
            Self::Close => "CloseMessage",
            Self::Ping => "PingMessage",
            Self::Pong => "PongMessage",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Message
// ============================================================================

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame kind.
    pub kind: MessageKind,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Message {
    /// Creates a text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: text.into().into_bytes(),
        }
    }

    /// Creates a binary message.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: data.into(),
        }
    }

    /// Returns the payload as UTF-8, if valid.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Consumes the message, returning the payload as UTF-8, if valid.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        String::from_utf8(self.data).ok()
    }

    /// Payload length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for an empty payload.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Converts a received frame. Raw frames have no counterpart.
    pub(crate) fn from_ws(message: WsMessage) -> Option<Self> {
        let (kind, data) = match message {
            WsMessage::Text(text) => (MessageKind::Text, text.as_str().as_bytes().to_vec()),
            WsMessage::Binary(bytes) => (MessageKind::Binary, bytes.to_vec()),
            WsMessage::Ping(bytes) => (MessageKind::Ping, bytes.to_vec()),
            WsMessage::Pong(bytes) => (MessageKind::Pong, bytes.to_vec()),
            WsMessage::Close(_) => (MessageKind::Close, Vec::new()),
            WsMessage::Frame(_) => return None,
        };
        Some(Self { kind, data })
    }

    pub(crate) fn into_ws(self) -> WsMessage {
        match self.kind {
            MessageKind::Text => {
                let text = String::from_utf8(self.data)
                    .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
                WsMessage::Text(text.into())
            }
            MessageKind::Binary => WsMessage::Binary(self.data.into()),
            MessageKind::Ping => WsMessage::Ping(self.data.into()),
            MessageKind::Pong => WsMessage::Pong(self.data.into()),
            MessageKind::Close => WsMessage::Close(None),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) if self.kind == MessageKind::Text => write!(f, "{}: {text}", self.kind),
            _ => write!(f, "{}: {} bytes", self.kind, self.data.len()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
