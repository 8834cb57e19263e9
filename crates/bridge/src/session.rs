//! Session state and events published to collaborators

use contracts::SteeringClass;

/// Lifecycle of one experiment session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for both streams to be bound
    #[default]
    Disconnected,
    /// Both streams bound, waiting for the start code
    AwaitingStart,
    Running,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::AwaitingStart => "awaiting_start",
            SessionState::Running => "running",
            SessionState::Ended => "ended",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to session observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    /// Steering class changed
    Cue(SteeringClass),
    Ended,
    /// Motion halts while the baseline is recorded
    BaselineCheckpoint,
    /// Baseline window over, motion resumes
    BaselineAfter,
}

impl SessionEvent {
    /// Event name without payload
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Started => "started",
            SessionEvent::Cue(_) => "cue",
            SessionEvent::Ended => "ended",
            SessionEvent::BaselineCheckpoint => "baseline_checkpoint",
            SessionEvent::BaselineAfter => "baseline_after",
        }
    }
}

/// What one tick observed
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickReport {
    pub state: SessionState,
    pub connected: bool,
    pub steering: f64,
    pub markers_processed: usize,
    pub signal_samples: usize,
}
