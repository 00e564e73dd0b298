//! Named event listeners.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::identifiers::SubscriptionId;

/// Listener invoked with the emitted payload.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registry of listeners keyed by event name.
///
/// Listeners run in registration order. [`Emitter::emit`] only snapshots
/// the matching listeners; the caller invokes them, so a listener may
/// register or remove others without deadlocking.
#[derive(Default)]
pub struct Emitter {
    listeners: Vec<(SubscriptionId, String, Listener)>,
}

impl Emitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `listener` for `event`.
    pub fn on(&mut self, event: impl Into<String>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.listeners.push((id, event.into(), listener));
        id
    }

    /// Removes a listener. Returns `false` if `id` was unknown.
    pub fn off(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sub, _, _)| *sub != id);
        self.listeners.len() != before
    }

    /// Returns the listeners for `event`.
    #[must_use]
    pub fn listeners(&self, event: &str) -> Vec<Listener> {
        self.listeners
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect()
    }

    /// Returns the number of listeners for `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.listeners.iter().filter(|(_, name, _)| name == event).count()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
