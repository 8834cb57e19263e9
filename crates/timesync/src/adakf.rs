//! Adaptive Kalman Filter (AdaKF) over a level + slope state.
//!
//! Used twice: to smooth clock-offset measurements across probe waves
//! (level = offset, slope = drift per second) and to dejitter timestamps
//! against the sample index (level = time, slope = sampling period, one step
//! per sample). Measurement noise follows an EWMA of the squared residuals.

use std::collections::VecDeque;

use contracts::AdaKFConfig;

const MIN_DT: f64 = 1e-3;
const DEFAULT_ALPHA: f64 = 0.85;

/// State vector x = [level, slope]^T
///
/// Transition matrix F = [[1, Δt], [0, 1]]
/// Observation matrix H = [1, 0]
#[derive(Debug, Clone)]
pub struct AdaKF {
    state: [f64; 2],
    covariance: [[f64; 2]; 2],
    q_level: f64,
    q_slope: f64,
    base_r: f64,
    /// Current measurement noise
    r: f64,
    ewma_variance: f64,
    residuals: VecDeque<f64>,
    window_size: usize,
    alpha: f64,
    /// Step used when the caller's `dt` is unusable
    default_dt: f64,
    updates: u64,
}

impl AdaKF {
    pub fn new(config: &AdaKFConfig) -> Self {
        let window_size = config.residual_window.max(3);
        let q_level = config.process_noise.max(1e-12);
        let q_slope = (config.process_noise * 0.1).max(1e-12);
        let base_r = config.measurement_noise.max(1e-12);
        let default_dt = config.expected_interval.unwrap_or(0.05).max(MIN_DT);

        Self {
            state: [config.initial_offset, config.initial_drift],
            covariance: [[base_r, 0.0], [0.0, q_slope]],
            q_level,
            q_slope,
            base_r,
            r: base_r,
            ewma_variance: base_r,
            residuals: VecDeque::with_capacity(window_size),
            window_size,
            alpha: DEFAULT_ALPHA,
            default_dt,
            updates: 0,
        }
    }

    /// Level expected after `dt` without a new observation
    pub fn predict(&self, dt: f64) -> f64 {
        self.state[0] + self.sanitize_dt(dt) * self.state[1]
    }

    fn sanitize_dt(&self, dt: f64) -> f64 {
        if dt.is_finite() && dt > 0.0 {
            dt
        } else {
            self.default_dt
        }
        .max(MIN_DT)
    }

    /// Fold in an observation taken `dt` after the previous one.
    ///
    /// Returns the filtered level and the innovation (observation - prediction).
    pub fn update(&mut self, observation: f64, dt: f64) -> (f64, f64) {
        let dt = self.sanitize_dt(dt);

        // ===== Predict step =====
        let level_pred = self.state[0] + dt * self.state[1];
        let slope_pred = self.state[1];

        let p00 = self.covariance[0][0];
        let p01 = self.covariance[0][1];
        let p11 = self.covariance[1][1];

        let pred00 = p00 + 2.0 * dt * p01 + dt * dt * p11 + self.q_level;
        let pred01 = p01 + dt * p11;
        let pred11 = p11 + self.q_slope;

        // ===== Update step =====
        let residual = observation - level_pred;
        let s = pred00 + self.r;
        let k0 = pred00 / s;
        let k1 = pred01 / s;

        let new_level = level_pred + k0 * residual;
        let new_slope = slope_pred + k1 * residual;

        let new_p00 = (1.0 - k0) * pred00;
        let new_p01 = (1.0 - k0) * pred01;
        let new_p11 = pred11 - k1 * pred01;

        self.state = [new_level, new_slope];
        self.covariance = [[new_p00.max(0.0), new_p01], [new_p01, new_p11.max(0.0)]];
        self.updates += 1;

        self.record_residual(residual);
        self.update_measurement_noise(residual);

        (self.state[0], residual)
    }

    /// Restart from a new level, keeping tuning and slope
    pub fn reset(&mut self, level: f64) {
        self.state[0] = level;
        self.covariance = [[self.base_r, 0.0], [0.0, self.q_slope]];
        self.residuals.clear();
        self.ewma_variance = self.base_r;
        self.r = self.base_r;
    }

    pub fn level(&self) -> f64 {
        self.state[0]
    }

    pub fn slope(&self) -> f64 {
        self.state[1]
    }

    /// Variance of the level estimate
    pub fn uncertainty(&self) -> f64 {
        self.covariance[0][0]
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Current adapted measurement noise
    pub fn measurement_noise(&self) -> f64 {
        self.r
    }

    fn record_residual(&mut self, residual: f64) {
        self.residuals.push_back(residual);
        if self.residuals.len() > self.window_size {
            self.residuals.pop_front();
        }
    }

    fn update_measurement_noise(&mut self, residual: f64) {
        self.ewma_variance =
            self.alpha * self.ewma_variance + (1.0 - self.alpha) * residual.powi(2);
        let r_min = self.base_r * 0.1;
        let r_max = self.base_r * 10.0;
        self.r = self.ewma_variance.clamp(r_min, r_max);
    }

    /// RMS of the recent residuals
    pub fn residual_rms(&self) -> f64 {
        if self.residuals.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.residuals.iter().map(|r| r * r).sum();
        (sum / self.residuals.len() as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let kf = AdaKF::new(&AdaKFConfig::default());
        assert_eq!(kf.level(), 0.0);
        assert_eq!(kf.slope(), 0.0);
        assert_eq!(kf.updates(), 0);
    }

    #[test]
    fn test_converges_to_constant_offset() {
        let mut kf = AdaKF::new(&AdaKFConfig::default());
        let true_offset = 0.01;
        for _ in 0..50 {
            kf.update(true_offset, 0.05);
        }
        assert!(
            (kf.level() - true_offset).abs() < 0.001,
            "expected ~{true_offset}, got {}",
            kf.level()
        );
    }

    #[test]
    fn test_noisy_offsets() {
        let config = AdaKFConfig {
            measurement_noise: 0.01,
            ..AdaKFConfig::default()
        };
        let mut kf = AdaKF::new(&config);
        let true_offset = 0.05;
        for i in 0..100 {
            let noise = ((i % 10) as f64 - 5.0) * 0.002;
            kf.update(true_offset + noise, 0.05);
        }
        assert!((kf.level() - true_offset).abs() < 0.01, "got {}", kf.level());
    }

    #[test]
    fn test_tracks_period_of_jittered_timestamps() {
        let period = 1.0 / 128.0;
        let mut kf = AdaKF::new(&AdaKFConfig::dejitter(100.0, period));
        let mut worst_raw: f64 = 0.0;
        let mut worst_smoothed: f64 = 0.0;
        for i in 1..2000 {
            let ideal = 100.0 + i as f64 * period;
            let jitter = if i % 2 == 0 { 0.002 } else { -0.002 };
            let (smoothed, _) = kf.update(ideal + jitter, 1.0);
            if i > 1000 {
                worst_raw = worst_raw.max(jitter.abs());
                worst_smoothed = worst_smoothed.max((smoothed - ideal).abs());
            }
        }
        assert!(worst_smoothed < worst_raw, "{worst_smoothed} vs {worst_raw}");
        assert!((kf.slope() - period).abs() < 1e-4);
    }

    #[test]
    fn test_reset_moves_level() {
        let mut kf = AdaKF::new(&AdaKFConfig::dejitter(0.0, 0.01));
        kf.update(0.01, 1.0);
        kf.reset(50.0);
        assert_eq!(kf.level(), 50.0);
        assert!((kf.predict(1.0) - 50.01).abs() < 1e-3);
    }
}
