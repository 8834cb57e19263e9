//! # Bridge
//!
//! Session layer between the lab streams and the kart game.
//!
//! - Binds a classifier signal stream and a stimulus marker stream found by
//!   a [`discovery::ContinuousResolver`]
//! - Turns marker codes into steering classes and scales the signal by them
//! - Republishes session, cue and trial markers on its own outlet
//! - Tells collaborators about the session through [`SessionEvent`]s

mod bridge;
mod error;
mod scheduler;
mod session;

pub use bridge::{ExperimentBridge, DEFAULT_BIND_TIMEOUT};
pub use error::BridgeError;
pub use scheduler::{ScheduledAction, Scheduler};
pub use session::{SessionEvent, SessionState, TickReport};
