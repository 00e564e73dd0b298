//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//! Counter-based IDs are process-unique and never reused.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// Counter IDs
// ============================================================================

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(u64);

        impl $name {
            /// Allocates the next process-unique identifier.
            #[must_use]
            pub fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Identifies a [`Loop`](crate::ev::Loop).
    ///
    /// Handlers shared between loops key their per-loop state by it.
    LoopId,
    "loop"
);

counter_id!(
    /// Identifies a [`Connection`](crate::ws::Connection).
    ConnectionId,
    "conn"
);

counter_id!(
    /// Opaque handle returned by event listener registration.
    ///
    /// Pass it back to `off` to remove the listener.
    SubscriptionId,
    "sub"
);

// ============================================================================
// InstanceId
// ============================================================================

/// Identifies a runtime instance (master or fork).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generates a new random instance ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Tests
// ============================================================================
