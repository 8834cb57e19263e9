//! Clock - monotonic time source in seconds

use std::time::{Duration, Instant};

/// Monotonic clock reading seconds since a captured origin.
///
/// Copies share the origin, so readings from clones are directly comparable.
/// A shifted clock models a machine whose clock runs ahead (or behind) by a
/// constant amount.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    offset: f64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: 0.0,
        }
    }

    /// Fresh clock whose readings are shifted by `offset` seconds
    pub fn with_offset(offset: f64) -> Self {
        Self {
            offset,
            ..Self::new()
        }
    }

    /// Same origin, readings shifted by a further `offset` seconds
    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            origin: self.origin,
            offset: self.offset + offset,
        }
    }

    /// Current time in seconds
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() + self.offset
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Seconds until a reading of `deadline`, zero if already past
    pub fn until(&self, deadline: f64) -> Duration {
        Duration::from_secs_f64((deadline - self.now()).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a >= 0.0);
    }

    #[test]
    fn test_shifted_shares_origin() {
        let clock = Clock::new();
        let remote = clock.shifted(5.0);
        let diff = remote.now() - clock.now();
        assert!((diff - 5.0).abs() < 0.01, "diff {diff}");
    }

    #[test]
    fn test_until() {
        let clock = Clock::new();
        assert_eq!(clock.until(clock.now() - 1.0), Duration::ZERO);
        assert!(clock.until(clock.now() + 1.0) > Duration::from_millis(900));
    }
}
