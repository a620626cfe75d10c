//! Clock abstraction for deadlines, pacing and liveness checks.

use std::time::{Duration, Instant};

/// Monotonic time source.
///
/// Sessions read `now()` to stamp contact with the peer and `sleep()` to pace
/// frames (ISO-TP STmin, TP2.0 inter-frame wait).
pub trait Clock: Send {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
    /// Block the caller for `duration`.
    fn sleep(&self, duration: Duration);

    fn elapsed_since(&self, earlier: Duration) -> Duration {
        self.now().saturating_sub(earlier)
    }
}

/// Standard library clock wrapper.
#[derive(Clone, Copy, Debug)]
pub struct StdClock {
    origin: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

#[cfg(any(test, feature = "mock"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "mock"))]
mod manual {
    use super::Clock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Test clock: time only moves on `advance` or `sleep`.
    #[derive(Clone, Debug, Default)]
    pub struct ManualClock {
        now: Arc<Mutex<Duration>>,
        slept: Arc<Mutex<Vec<Duration>>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }

        /// Every sleep requested so far, in order.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.slept.lock().clone()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock()
        }

        fn sleep(&self, duration: Duration) {
            self.slept.lock().push(duration);
            self.advance(duration);
        }
    }
}
