//! Bridge session driving.

mod runner;
mod stats;

pub use runner::{SessionConfig, SessionRunner};
pub use stats::SessionStats;
