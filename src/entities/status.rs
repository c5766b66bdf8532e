use std::time::Duration;

/// A timed buff or debuff. Decayed by the tick loops, applied under the
/// owning entity's status lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedStatus {
    pub name: String,
    pub remaining: Duration,
    pub threat_bonus: u32,
}

impl TimedStatus {
    pub fn new(name: impl Into<String>, remaining: Duration, threat_bonus: u32) -> Self {
        Self {
            name: name.into(),
            remaining,
            threat_bonus,
        }
    }
}

/// Subtracts `elapsed` from every status and drops the expired ones.
pub fn decay_statuses(statuses: &mut Vec<TimedStatus>, elapsed: Duration) {
    for status in statuses.iter_mut() {
        status.remaining = status.remaining.saturating_sub(elapsed);
    }
    statuses.retain(|status| !status.remaining.is_zero());
}
