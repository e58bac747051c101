use std::time::{Duration, Instant};

/// A deadline measured from construction.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.instant.elapsed())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    /// Time left, capped to `slice`. Used by loops that must wake periodically.
    #[inline]
    pub fn slice(&self, slice: Duration) -> Duration {
        self.remaining().min(slice)
    }
}
