//! Local time, durations and the timeout queue used by the reactor.

use std::sync::atomic;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time in milliseconds since the epoch.
///
/// Monotonic: a system clock that jumps backwards is clamped to the
/// last value handed out.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    millis: u64,
}

impl LocalTime {
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).millis;
        let last = LAST.load(atomic::Ordering::SeqCst);

        if now < last {
            Self { millis: last }
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            Self { millis: now }
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub fn as_secs(&self) -> u64 {
        self.millis / 1000
    }

    pub fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Absolute difference between two times.
    pub fn diff(&self, other: LocalTime) -> LocalDuration {
        if self > &other {
            *self - other
        } else {
            other - *self
        }
    }
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .expect("system time is past the epoch")
            .as_millis() as u64;

        Self { millis }
    }
}

impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally, in milliseconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub struct LocalDuration(u64);

impl LocalDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn clamp(self, min: LocalDuration, max: LocalDuration) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    pub fn min(self, other: LocalDuration) -> Self {
        Self(self.0.min(other.0))
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1000 {
            write!(f, "{} millisecond(s)", self.0)
        } else if self.as_secs() < 60 {
            write!(f, "{} second(s)", self.as_secs())
        } else {
            write!(f, "{} minute(s)", self.as_secs() / 60)
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0)
    }
}

/// Clock that tells the time.
pub trait Clock: Clone {
    fn local_time(&self) -> LocalTime;
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// Clock with interior mutability, shared between the reactor and
/// tests that drive time by hand.
#[derive(Debug, Clone, Default)]
pub struct RefClock {
    inner: Arc<Mutex<LocalTime>>,
}

impl RefClock {
    pub fn from(time: LocalTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(time)),
        }
    }

    pub fn set(&self, time: LocalTime) {
        *self.inner.lock().unwrap() = time;
    }

    pub fn elapse(&self, duration: LocalDuration) {
        let mut time = self.inner.lock().unwrap();
        *time = *time + duration;
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.lock().unwrap()
    }
}

/// Manages timers and triggers timeouts.
pub struct TimeoutManager<K> {
    timeouts: Vec<(K, LocalTime)>,
    threshold: LocalDuration,
}

impl<K> TimeoutManager<K> {
    /// Takes a threshold below which two timeouts cannot overlap.
    pub fn new(threshold: LocalDuration) -> Self {
        Self {
            timeouts: vec![],
            threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// Register a new timeout with an associated key and wake-up time.
    /// Timeouts too close to an existing one are coalesced into it.
    pub fn register(&mut self, key: K, time: LocalTime) -> bool {
        if self
            .timeouts
            .iter()
            .any(|(_, t)| t.diff(time) < self.threshold)
        {
            return false;
        }

        self.timeouts.push((key, time));
        self.timeouts.sort_unstable_by(|(_, a), (_, b)| b.cmp(a));

        true
    }

    /// Minimum duration to wait for at least one timeout to be
    /// reached. `None` if there are no timeouts.
    pub fn next(&self, now: impl Into<LocalTime>) -> Option<LocalDuration> {
        let now = now.into();

        self.timeouts.last().map(|(_, t)| {
            if *t >= now {
                *t - now
            } else {
                LocalDuration::from_secs(0)
            }
        })
    }

    /// Populate the input vector with the keys that have timed out.
    /// Returns the number of keys that timed out.
    pub fn wake(&mut self, now: LocalTime, woken: &mut Vec<K>) -> usize {
        let before = woken.len();

        while let Some((k, t)) = self.timeouts.pop() {
            if now >= t {
                woken.push(k);
            } else {
                self.timeouts.push((k, t));
                break;
            }
        }
        woken.len() - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_wake_in_order() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_millis(10));
        let now = LocalTime::from_secs(100);

        mgr.register('a', now + LocalDuration::from_secs(1));
        mgr.register('b', now + LocalDuration::from_secs(3));
        mgr.register('c', now + LocalDuration::from_secs(2));

        let mut woken = Vec::new();
        assert_eq!(mgr.wake(now + LocalDuration::from_secs(2), &mut woken), 2);
        assert_eq!(woken, vec!['a', 'c']);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn close_timeouts_coalesce() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_millis(250));
        let now = LocalTime::from_secs(100);

        assert!(mgr.register((), now + LocalDuration::from_millis(500)));
        assert!(!mgr.register((), now + LocalDuration::from_millis(600)));
        assert!(mgr.register((), now + LocalDuration::from_millis(800)));
    }

    #[test]
    fn next_is_zero_for_overdue_timeouts() {
        let mut mgr = TimeoutManager::new(LocalDuration::from_millis(10));
        let now = LocalTime::from_secs(100);

        mgr.register((), now + LocalDuration::from_secs(1));
        assert_eq!(
            mgr.next(now + LocalDuration::from_secs(5)),
            Some(LocalDuration::from_secs(0))
        );
    }
}
