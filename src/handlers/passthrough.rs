//! Identity handler.

use crate::error::{Error, Result};
use crate::ev::{Callback, Handler, Loop, Outcome, Request};

/// Answers [`Request::Value`] with the same value, synchronously.
///
/// Never holds outstanding work, so it does not keep a loop alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughHandler;

impl PassthroughHandler {
    /// Creates the handler.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Handler for PassthroughHandler {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn handle(&self, _ev: &Loop, request: Request, callback: Callback) -> Result<()> {
        match request {
            Request::Value(value) => {
                callback.invoke(Ok(Outcome::Value(value)));
                Ok(())
            }
            other => Err(Error::unsupported_request(self.name(), other.name())),
        }
    }

    fn is_active(&self, _ev: &Loop) -> bool {
        false
    }

    fn stop(&self) {}
}

// ============================================================================
// Tests
// ============================================================================
