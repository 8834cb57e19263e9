//! Clock-offset estimation from probe round trips.
//!
//! A probe records four readings: `t0` local send, `t1` remote receive,
//! `t2` remote reply, `t3` local receive. With symmetric path delays the
//! remote clock leads the local one by `((t1 - t0) + (t2 - t3)) / 2`; the
//! correction to add to remote timestamps is the negation of that.

use contracts::AdaKFConfig;
use tracing::trace;

use crate::AdaKF;

/// One completed probe round trip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
}

impl ProbeSample {
    /// Network round-trip time, excluding remote processing
    pub fn round_trip(&self) -> f64 {
        (self.t3 - self.t0) - (self.t2 - self.t1)
    }

    /// How far the remote clock runs ahead of the local one
    pub fn remote_lead(&self) -> f64 {
        ((self.t1 - self.t0) + (self.t2 - self.t3)) / 2.0
    }

    /// Value to add to a remote timestamp to express it locally
    pub fn correction(&self) -> f64 {
        -self.remote_lead()
    }
}

/// Best measurement of one probe wave
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetMeasurement {
    pub correction: f64,
    pub round_trip: f64,
    /// Local time the measurement was taken
    pub taken_at: f64,
}

/// Pick the probe with minimal round trip; lower delay means less asymmetry.
pub fn best_of_wave(samples: &[ProbeSample]) -> Option<OffsetMeasurement> {
    samples
        .iter()
        .filter(|s| s.round_trip().is_finite() && s.round_trip() >= 0.0)
        .min_by(|a, b| a.round_trip().total_cmp(&b.round_trip()))
        .map(|s| OffsetMeasurement {
            correction: s.correction(),
            round_trip: s.round_trip(),
            taken_at: s.t3,
        })
}

/// Running, filtered clock correction of one inlet
#[derive(Debug, Clone)]
pub struct OffsetTracker {
    filter: Option<AdaKF>,
    last: Option<OffsetMeasurement>,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            filter: None,
            last: None,
        }
    }

    /// Fold in a wave measurement, returning the filtered correction
    pub fn update(&mut self, measurement: OffsetMeasurement) -> f64 {
        let correction = match (&mut self.filter, self.last) {
            (Some(filter), Some(last)) => {
                let dt = measurement.taken_at - last.taken_at;
                filter.update(measurement.correction, dt).0
            }
            _ => {
                self.filter = Some(AdaKF::new(&AdaKFConfig::clock_offset(
                    measurement.correction,
                )));
                measurement.correction
            }
        };
        trace!(
            raw = measurement.correction,
            filtered = correction,
            rtt = measurement.round_trip,
            "Clock offset updated"
        );
        self.last = Some(measurement);
        correction
    }

    /// Current filtered correction, if any wave completed
    pub fn correction(&self) -> Option<f64> {
        self.filter.as_ref().map(AdaKF::level)
    }

    pub fn last_measurement(&self) -> Option<OffsetMeasurement> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Remote clock 5 s ahead, 2 ms each way, 0.1 ms processing
    fn probe(t0: f64, one_way: f64) -> ProbeSample {
        let t1 = t0 + one_way + 5.0;
        let t2 = t1 + 0.0001;
        let t3 = t2 - 5.0 + one_way;
        ProbeSample { t0, t1, t2, t3 }
    }

    #[test]
    fn test_symmetric_probe_math() {
        let p = probe(10.0, 0.002);
        assert!((p.round_trip() - 0.004).abs() < 1e-9);
        assert!((p.correction() + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_best_of_wave_prefers_short_round_trip() {
        let mut slow = probe(1.0, 0.050);
        // asymmetric slow probe would bias the offset
        slow.t3 += 0.020;
        let fast = probe(2.0, 0.001);
        let best = best_of_wave(&[slow, fast]).unwrap();
        assert!((best.round_trip - 0.002).abs() < 1e-9);
        assert!((best.correction + 5.0).abs() < 1e-9);
        assert!(best_of_wave(&[]).is_none());
    }

    #[test]
    fn test_tracker_first_wave_is_exact() {
        let mut tracker = OffsetTracker::new();
        assert!(tracker.correction().is_none());
        let m = best_of_wave(&[probe(0.0, 0.001)]).unwrap();
        assert!((tracker.update(m) + 5.0).abs() < 1e-9);
        assert!((tracker.correction().unwrap() + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_smooths_outlier() {
        let mut tracker = OffsetTracker::new();
        for i in 0..10 {
            let m = best_of_wave(&[probe(i as f64 * 2.0, 0.001)]).unwrap();
            tracker.update(m);
        }
        let outlier = OffsetMeasurement {
            correction: -5.010,
            round_trip: 0.002,
            taken_at: 22.0,
        };
        let filtered = tracker.update(outlier);
        assert!((filtered + 5.0).abs() < 0.010);
    }
}
