//! One-shot actions fired by the tick loop once their deadline has passed

/// Something to do later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledAction {
    /// Baseline window of a calibration checkpoint is over
    BaselineAfter,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    /// (deadline, insertion order, action)
    pending: Vec<(f64, u64, ScheduledAction)>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `action` on the first poll at or after `deadline` (clock seconds)
    pub fn schedule(&mut self, deadline: f64, action: ScheduledAction) {
        self.pending.push((deadline, self.next_seq, action));
        self.next_seq += 1;
    }

    /// Remove and return every action due at `now`, earliest first
    pub fn take_due(&mut self, now: f64) -> Vec<ScheduledAction> {
        let mut due: Vec<_> = Vec::new();
        self.pending.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        due.into_iter().map(|(_, _, action)| action).collect()
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Deadline of the next pending action
    pub fn next_deadline(&self) -> Option<f64> {
        self.pending
            .iter()
            .map(|entry| entry.0)
            .min_by(f64::total_cmp)
    }
}
