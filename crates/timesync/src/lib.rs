//! # Timesync
//!
//! Clock and timestamp handling for stream endpoints.
//!
//! Responsibilities:
//! - Monotonic `Clock` owned by a stream context
//! - Probe-wave clock-offset estimation (min round trip, AdaKF smoothing)
//! - Inlet timestamp post-processing (clock sync, dejitter, monotonize)
//!
//! ## Example
//!
//! ```
//! use timesync::{best_of_wave, ProbeSample};
//!
//! let probe = ProbeSample { t0: 1.0, t1: 6.001, t2: 6.001, t3: 1.002 };
//! let best = best_of_wave(&[probe]).unwrap();
//! assert!((best.correction + 5.0).abs() < 1e-9);
//! ```

mod adakf;
mod clock;
mod offset;
mod postproc;

pub use adakf::AdaKF;
pub use clock::Clock;
pub use offset::{best_of_wave, OffsetMeasurement, OffsetTracker, ProbeSample};
pub use postproc::TimestampPostProcessor;
