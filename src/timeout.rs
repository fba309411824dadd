//! Deferred callbacks for protocol retries.
//!
//! # Architecture
//!
//! [`TimeoutScheduler`] keeps a registry of armed deadlines and fires the
//! associated callbacks from [`run_once`](TimeoutScheduler::run_once), which
//! the owner calls periodically (typically from the link's timer loop). The
//! scheduler spawns no threads; callbacks run on whichever thread drives it.
//!
//! A callback fires at most once per arm. [`refresh`](TimeoutScheduler::
//! refresh) re-arms the registration and resets its deadline, which is how
//! the state machines implement "reset the retry timer on progress" and
//! "schedule another retry".
//!
//! # Time
//!
//! Time is injected through the [`TimeSource`] trait so deadline logic can be
//! tested deterministically: [`MonotonicTime`] for production, [`MockTime`]
//! with controllable advancement for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Monotonic clock readable as microseconds since an arbitrary origin.
pub trait TimeSource: Send + Sync {
    /// Current time in microseconds since the source's origin.
    fn now_us(&self) -> u64;
}

/// Production time source backed by [`Instant`].
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Test time source with controllable advancement.
#[derive(Default)]
pub struct MockTime {
    current_us: AtomicU64,
}

impl MockTime {
    /// Creates a new `MockTime` starting at time 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time to an absolute value.
    pub fn set(&self, us: u64) {
        self.current_us.store(us, Ordering::SeqCst);
    }

    /// Advances the current time by the specified amount.
    pub fn advance(&self, us: u64) {
        self.current_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl TimeSource for MockTime {
    fn now_us(&self) -> u64 {
        self.current_us.load(Ordering::SeqCst)
    }
}

/// Callback fired when an armed deadline expires.
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

struct TimeoutEntry {
    id: u64,
    deadline_us: u64,
    interval: Duration,
    armed: bool,
    callback: TimeoutCallback,
}

struct Registry {
    time: Arc<dyn TimeSource>,
    entries: Mutex<Vec<TimeoutEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.id != id);
    }
}

/// Registry of deferred callbacks with arm/refresh/cancel semantics.
pub struct TimeoutScheduler {
    registry: Arc<Registry>,
}

impl TimeoutScheduler {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            registry: Arc::new(Registry {
                time,
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Arm `callback` to fire once `timeout` from now.
    ///
    /// The registration lives as long as the returned cookie; dropping the
    /// cookie cancels it.
    pub fn arm(&self, timeout: Duration, callback: TimeoutCallback) -> TimeoutCookie {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline_us = self
            .registry
            .time
            .now_us()
            .saturating_add(timeout.as_micros() as u64);
        let mut entries = self
            .registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries.push(TimeoutEntry {
            id,
            deadline_us,
            interval: timeout,
            armed: true,
            callback,
        });
        TimeoutCookie {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Re-arm a registration and reset its deadline to `interval` from now.
    ///
    /// Works both on a pending registration (pushes the deadline out) and on
    /// one that already fired (schedules it again). A stale cookie is a no-op.
    pub fn refresh(&self, cookie: &TimeoutCookie) {
        let now_us = self.registry.time.now_us();
        let mut entries = self
            .registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|e| e.id == cookie.id) {
            entry.deadline_us = now_us.saturating_add(entry.interval.as_micros() as u64);
            entry.armed = true;
        }
    }

    /// Fire every armed callback whose deadline has passed.
    ///
    /// Each fired registration is disarmed first and its callback invoked
    /// outside the registry lock, so callbacks may arm, refresh or drop
    /// registrations (including their own).
    pub fn run_once(&self) {
        let now_us = self.registry.time.now_us();
        let due: Vec<TimeoutCallback> = {
            let mut entries = self
                .registry
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            entries
                .iter_mut()
                .filter(|e| e.armed && now_us >= e.deadline_us)
                .map(|e| {
                    e.armed = false;
                    Arc::clone(&e.callback)
                })
                .collect()
        };
        for callback in due {
            callback();
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Owned timer token; dropping it cancels the registration.
pub struct TimeoutCookie {
    registry: Weak<Registry>,
    id: u64,
}

impl Drop for TimeoutCookie {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<MockTime>, TimeoutScheduler) {
        let time = Arc::new(MockTime::new());
        let scheduler = TimeoutScheduler::new(Arc::clone(&time) as Arc<dyn TimeSource>);
        (time, scheduler)
    }

    fn counting_callback() -> (Arc<AtomicUsize>, TimeoutCallback) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = Arc::clone(&fired);
        let callback: TimeoutCallback = Arc::new(move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });
        (fired, callback)
    }

    #[test]
    fn test_fires_after_deadline() {
        let (time, scheduler) = setup();
        let (fired, callback) = counting_callback();
        let _cookie = scheduler.arm(Duration::from_millis(500), callback);

        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        time.advance(499_999);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        time.advance(1);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fires_at_most_once_without_refresh() {
        let (time, scheduler) = setup();
        let (fired, callback) = counting_callback();
        let _cookie = scheduler.arm(Duration::from_millis(1), callback);

        time.advance(10_000);
        scheduler.run_once();
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_resets_deadline() {
        let (time, scheduler) = setup();
        let (fired, callback) = counting_callback();
        let cookie = scheduler.arm(Duration::from_millis(500), callback);

        time.advance(400_000);
        scheduler.refresh(&cookie);
        time.advance(400_000);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        time.advance(100_000);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_rearms_after_fire() {
        let (time, scheduler) = setup();
        let (fired, callback) = counting_callback();
        let cookie = scheduler.arm(Duration::from_millis(500), callback);

        time.advance(500_000);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        scheduler.refresh(&cookie);
        time.advance(500_000);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cookie_drop_cancels() {
        let (time, scheduler) = setup();
        let (fired, callback) = counting_callback();
        let cookie = scheduler.arm(Duration::from_millis(500), callback);
        assert_eq!(scheduler.entry_count(), 1);

        drop(cookie);
        assert_eq!(scheduler.entry_count(), 0);

        time.advance(1_000_000);
        scheduler.run_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mock_time_advance() {
        let time = MockTime::new();
        assert_eq!(time.now_us(), 0);
        time.advance(1_500);
        assert_eq!(time.now_us(), 1_500);
        time.set(42);
        assert_eq!(time.now_us(), 42);
    }
}
