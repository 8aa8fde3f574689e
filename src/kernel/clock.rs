//! Injectable time and jittered-random sources.
//!
//! Every timing decision in the poller flows through these two traits rather
//! than calling `Utc::now()`/`rand::thread_rng()` directly, so the state
//! machine tests can drive the clock and pin the jitter instead of racing
//! real wall-clock time.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A source of jitter. `jitter(range)` returns a value uniformly distributed
/// in `[-range, range]`.
pub trait Random: Send + Sync {
    fn jitter(&self, range: f64) -> f64;
}

/// The real clock, backed by `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The real jitter source, backed by `rand::thread_rng()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRandom;

impl Random for SystemRandom {
    fn jitter(&self, range: f64) -> f64 {
        if range <= 0.0 {
            return 0.0;
        }
        use rand::Rng;
        rand::thread_rng().gen_range(-range..=range)
    }
}

/// A clock that can be moved forward on demand, for deterministic tests of
/// the poller's timeout and backoff logic.
pub struct FakeClock {
    millis_since_epoch: AtomicI64,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis_since_epoch: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.millis_since_epoch
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis_since_epoch
            .store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis_since_epoch.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }
}

/// A deterministic jitter source for tests: always returns 0, or a fixed
/// value set ahead of time.
pub struct FakeRandom {
    fixed: f64,
}

impl FakeRandom {
    pub fn zero() -> Self {
        Self { fixed: 0.0 }
    }

    pub fn fixed(value: f64) -> Self {
        Self { fixed: value }
    }
}

impl Random for FakeRandom {
    fn jitter(&self, range: f64) -> f64 {
        self.fixed.clamp(-range, range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }

    #[test]
    fn fake_random_is_deterministic() {
        let r = FakeRandom::zero();
        assert_eq!(r.jitter(100.0), 0.0);
    }

    #[test]
    fn system_random_stays_in_range() {
        let r = SystemRandom;
        for _ in 0..100 {
            let v = r.jitter(10.0);
            assert!((-10.0..=10.0).contains(&v));
        }
    }
}
