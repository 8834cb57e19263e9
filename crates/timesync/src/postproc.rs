//! Timestamp post-processing applied by inlets on pull.
//!
//! Stages run in a fixed order: clock sync, dejitter, monotonize.

use contracts::{AdaKFConfig, PostProcessing};
use tracing::debug;

use crate::AdaKF;

/// Gaps larger than this many sample periods restart the dejitter filter
const DEJITTER_RESET_PERIODS: f64 = 500.0;

#[derive(Debug, Clone)]
pub struct TimestampPostProcessor {
    flags: PostProcessing,
    /// Sampling period, `None` for irregular streams
    period: Option<f64>,
    dejitter: Option<AdaKF>,
    last_output: Option<f64>,
}

impl TimestampPostProcessor {
    pub fn new(flags: PostProcessing, nominal_srate: f64) -> Self {
        let period = (nominal_srate > 0.0).then(|| 1.0 / nominal_srate);
        Self {
            flags,
            period,
            dejitter: None,
            last_output: None,
        }
    }

    pub fn flags(&self) -> PostProcessing {
        self.flags
    }

    /// Change flags; filter state restarts
    pub fn set_flags(&mut self, flags: PostProcessing) {
        self.flags = flags;
        self.reset();
    }

    /// Forget filter and monotonize state (after reconnects)
    pub fn reset(&mut self) {
        self.dejitter = None;
        self.last_output = None;
    }

    /// Map one received timestamp.
    ///
    /// `correction` is the current clock correction, used when CLOCKSYNC is set.
    pub fn process(&mut self, timestamp: f64, correction: Option<f64>) -> f64 {
        let mut ts = timestamp;

        if self.flags.contains(PostProcessing::CLOCKSYNC) {
            ts += correction.unwrap_or(0.0);
        }

        if self.flags.contains(PostProcessing::DEJITTER) {
            ts = self.dejitter(ts);
        }

        if self.flags.contains(PostProcessing::MONOTONIZE) {
            if let Some(last) = self.last_output {
                ts = ts.max(last);
            }
        }

        self.last_output = Some(ts);
        ts
    }

    fn dejitter(&mut self, ts: f64) -> f64 {
        let Some(period) = self.period else {
            return ts;
        };
        match &mut self.dejitter {
            None => {
                self.dejitter = Some(AdaKF::new(&AdaKFConfig::dejitter(ts, period)));
                ts
            }
            Some(filter) => {
                let predicted = filter.predict(1.0);
                if (ts - predicted).abs() > DEJITTER_RESET_PERIODS * period {
                    debug!(
                        gap = ts - predicted,
                        "Timestamp discontinuity, restarting dejitter"
                    );
                    filter.reset(ts);
                    return ts;
                }
                filter.update(ts, 1.0).0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let mut pp = TimestampPostProcessor::new(PostProcessing::NONE, 100.0);
        assert_eq!(pp.process(3.5, Some(1.0)), 3.5);
        assert_eq!(pp.process(1.0, Some(1.0)), 1.0);
    }

    #[test]
    fn test_clocksync_adds_correction() {
        let mut pp = TimestampPostProcessor::new(PostProcessing::CLOCKSYNC, 0.0);
        assert_eq!(pp.process(10.0, Some(-5.0)), 5.0);
        assert_eq!(pp.process(11.0, None), 11.0);
    }

    #[test]
    fn test_monotonize() {
        let mut pp = TimestampPostProcessor::new(PostProcessing::MONOTONIZE, 0.0);
        assert_eq!(pp.process(2.0, None), 2.0);
        assert_eq!(pp.process(1.5, None), 2.0);
        assert_eq!(pp.process(3.0, None), 3.0);
    }

    #[test]
    fn test_dejitter_reduces_jitter() {
        let rate = 100.0;
        let mut pp = TimestampPostProcessor::new(PostProcessing::DEJITTER, rate);
        let mut raw_dev = 0.0;
        let mut out_dev = 0.0;
        for i in 0..3000 {
            let ideal = 50.0 + i as f64 / rate;
            let jitter = ((i * 7919) % 11) as f64 * 0.0004 - 0.002;
            let out = pp.process(ideal + jitter, None);
            if i >= 2000 {
                raw_dev += jitter.abs();
                out_dev += (out - ideal).abs();
            }
        }
        assert!(out_dev < raw_dev * 0.5, "{out_dev} vs {raw_dev}");
    }

    #[test]
    fn test_dejitter_skips_irregular_and_restarts_on_gap() {
        let mut irregular = TimestampPostProcessor::new(PostProcessing::DEJITTER, 0.0);
        assert_eq!(irregular.process(1.234, None), 1.234);

        let mut pp = TimestampPostProcessor::new(PostProcessing::DEJITTER, 100.0);
        pp.process(1.0, None);
        pp.process(1.01, None);
        assert_eq!(pp.process(500.0, None), 500.0);
    }
}
