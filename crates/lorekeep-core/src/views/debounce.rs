//! Debounce timer
//!
//! One deadline for all affected scopes. Every recorded mutation pushes the
//! deadline out by the full delay, so a burst of mutations collapses into one
//! pass once activity stops. Time is passed in explicitly.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::scope::ArtifactScope;

#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: BTreeSet<ArtifactScope>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Add scopes and restart the timer
    pub fn record(&mut self, scopes: impl IntoIterator<Item = ArtifactScope>, now: Instant) {
        let mut recorded = false;
        for scope in scopes {
            self.pending.insert(scope);
            recorded = true;
        }
        if recorded {
            self.deadline = Some(now + self.delay);
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &BTreeSet<ArtifactScope> {
        &self.pending
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the quiet period has elapsed
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    /// Take every pending scope and stop the timer
    pub fn take(&mut self) -> BTreeSet<ArtifactScope> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityId;

    const DELAY: Duration = Duration::from_millis(500);

    #[test]
    fn test_burst_coalesces_into_one_due_pass() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(DELAY);
        let alder = ArtifactScope::Group(EntityId(1));

        for i in 0..10 {
            let now = start + Duration::from_millis(100 * i);
            debouncer.record([ArtifactScope::Global, alder], now);
            assert!(!debouncer.is_due(now));
        }

        let last = start + Duration::from_millis(900);
        assert!(!debouncer.is_due(last + Duration::from_millis(499)));
        assert!(debouncer.is_due(last + DELAY));

        let scopes = debouncer.take();
        assert_eq!(scopes.len(), 2);
        assert!(!debouncer.is_pending());
        assert!(!debouncer.is_due(last + DELAY * 10));
    }

    #[test]
    fn test_record_restarts_deadline() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(DELAY);

        debouncer.record([ArtifactScope::Global], start);
        debouncer.record([ArtifactScope::Global], start + Duration::from_millis(400));

        assert_eq!(
            debouncer.deadline(),
            Some(start + Duration::from_millis(400) + DELAY)
        );
    }

    #[test]
    fn test_empty_record_does_not_arm() {
        let mut debouncer = Debouncer::new(DELAY);
        debouncer.record([], Instant::now());
        assert!(debouncer.deadline().is_none());
    }
}
