//! Synchronization primitives shared by the loop, handlers and runtime.
//!
//! Both types are built on `tokio::sync::watch`, so late subscribers
//! observe the current state instead of missing a notification.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

// ============================================================================
// Signal
// ============================================================================

/// A latch that fires at most once.
///
/// Used for "done", "stop" and "shutdown" notifications. Cloning shares
/// the same latch.
#[derive(Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Creates an unfired signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal.
    ///
    /// Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Returns `true` once the signal has fired.
    #[inline]
    #[must_use]
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal fires.
    ///
    /// Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

// ============================================================================
// WaitGroup
// ============================================================================

/// Counts outstanding units of work and lets callers await zero.
#[derive(Clone)]
pub struct WaitGroup {
    tx: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    /// Creates an empty wait group.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Registers one more unit of work.
    pub fn add(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    /// Marks one unit of work as finished.
    pub fn done(&self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Returns the number of outstanding units.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Waits until no work is outstanding.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
