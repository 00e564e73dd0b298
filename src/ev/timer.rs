//! Loop-owned timers.
//!
//! Timers live inside the loop state and are driven by the scheduler's
//! resampled clock. A [`TimerHandle`] only flips the shared `dropped` flag,
//! so stopping never races with the scheduler's own bookkeeping.
//!
//! The flag is flipped under a reentrant gate that a fire holds for the
//! whole callback. A stop from another thread therefore waits out a running
//! fire, and no fire starts once `stop` has returned. A callback may still
//! stop its own timer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};

use super::event_loop::WeakLoop;

// ============================================================================
// Types
// ============================================================================

type TimerFn = dyn FnMut() + Send;

// ============================================================================
// TimerEntry
// ============================================================================

/// Shared state of one timer.
pub(crate) struct TimerEntry {
    pub(crate) delay: Duration,
    pub(crate) repeat: bool,
    dropped: AtomicBool,
    gate: ReentrantMutex<()>,
    callback: Mutex<Box<TimerFn>>,
}

impl TimerEntry {
    pub(crate) fn new(delay: Duration, repeat: bool, callback: Box<TimerFn>) -> Self {
        Self {
            delay,
            repeat,
            dropped: AtomicBool::new(false),
            gate: ReentrantMutex::new(()),
            callback: Mutex::new(callback),
        }
    }

    #[inline]
    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn drop_timer(&self) {
        let _gate = self.gate.lock();
        self.dropped.store(true, Ordering::Release);
    }

    /// Runs the callback unless the timer was dropped in the meantime.
    pub(crate) fn fire(&self) {
        let _gate = self.gate.lock();
        if self.is_dropped() {
            return;
        }
        if !self.repeat {
            self.dropped.store(true, Ordering::Release);
        }
        let mut callback = self.callback.lock();
        (*callback)();
    }

    /// Swaps out the callback so its captures can be freed.
    ///
    /// Only the scheduler calls this, never from inside a fire.
    pub(crate) fn take_callback(&self) -> Box<TimerFn> {
        std::mem::replace(&mut *self.callback.lock(), Box::new(|| {}))
    }
}

/// A timer's slot in the loop's active set.
pub(crate) struct ScheduledTimer {
    pub(crate) next: Instant,
    pub(crate) entry: Arc<TimerEntry>,
}

// ============================================================================
// TimerHandle
// ============================================================================

/// Handle returned by [`Loop::timeout`](super::Loop::timeout).
///
/// Dropping the handle does not cancel the timer; call [`TimerHandle::stop`].
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
    ev: WeakLoop,
}

impl TimerHandle {
    pub(crate) fn new(entry: Arc<TimerEntry>, ev: WeakLoop) -> Self {
        Self { entry, ev }
    }

    /// Stops the timer. Its callback will not run again.
    pub fn stop(&self) {
        self.entry.drop_timer();
        if let Some(ev) = self.ev.upgrade() {
            ev.wake();
        }
    }

    /// Returns `true` while the timer may still fire.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.entry.is_dropped()
    }

    /// Returns the configured delay.
    #[inline]
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.entry.delay
    }

    /// Returns `true` for interval timers.
    #[inline]
    #[must_use]
    pub fn is_repeating(&self) -> bool {
        self.entry.repeat
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("delay", &self.entry.delay)
            .field("repeat", &self.entry.repeat)
            .field("pending", &self.is_pending())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn counting(repeat: bool) -> (Arc<TimerEntry>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        let entry = TimerEntry::new(
            Duration::from_millis(1),
            repeat,
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (Arc::new(entry), count)
    }

    #[test]
    fn test_one_shot_drops_after_fire() {
        let (entry, count) = counting(false);
        entry.fire();
        entry.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(entry.is_dropped());
    }

    #[test]
    fn test_repeat_keeps_firing_until_dropped() {
        let (entry, count) = counting(true);
        entry.fire();
        entry.fire();
        entry.drop_timer();
        entry.fire();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_stop_own_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<TimerEntry>>>> = Arc::new(Mutex::new(None));

        let hits = Arc::clone(&count);
        let me = Arc::clone(&slot);
        let entry = Arc::new(TimerEntry::new(
            Duration::from_millis(1),
            true,
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(entry) = me.lock().as_ref() {
                    entry.drop_timer();
                }
            }),
        ));
        *slot.lock() = Some(Arc::clone(&entry));

        entry.fire();
        entry.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        slot.lock().take();
    }

    #[test]
    fn test_stop_waits_for_running_fire() {
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let entry = Arc::new(TimerEntry::new(
            Duration::from_millis(1),
            true,
            Box::new(move || {
                s.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                f.store(true, Ordering::SeqCst);
            }),
        ));

        let firing = Arc::clone(&entry);
        let worker = std::thread::spawn(move || firing.fire());
        while !started.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        entry.drop_timer();
        assert!(finished.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[test]
    fn test_take_callback_releases_captures() {
        let held = Arc::new(());
        let capture = Arc::clone(&held);
        let entry = TimerEntry::new(
            Duration::from_millis(1),
            false,
            Box::new(move || {
                let _ = &capture;
            }),
        );
        assert_eq!(Arc::strong_count(&held), 2);

        drop(entry.take_callback());
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn test_handle_stop_without_loop() {
        let (entry, count) = counting(false);
        let handle = TimerHandle::new(Arc::clone(&entry), WeakLoop::new());
        assert!(handle.is_pending());

        handle.stop();
        entry.fire();
        assert!(!handle.is_pending());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
