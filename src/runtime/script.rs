//! The scripted behaviour of one runtime instance.

use crate::error::Result;

use super::context::Context;

/// User logic driven by a runtime instance.
///
/// `main` runs on the instance's loop before any other work. Callbacks it
/// registers through the [`Context`] run on the same loop, so they never
/// overlap with each other.
pub trait Script: Send + 'static {
    /// Entry point.
    ///
    /// # Errors
    ///
    /// An error is logged; the instance still drains the work it queued.
    fn main(&mut self, ctx: &Context) -> Result<()>;

    /// Called once when the instance has no more work, before `"exit"` is
    /// emitted.
    fn done(&mut self, _ctx: &Context) {}
}

/// Creates a fresh script for each instance.
pub type ScriptFactory = Box<dyn Fn() -> Box<dyn Script> + Send + Sync>;
