//! Keyed one-shot timers owned by the extensions

use meshbridge_core::TimerKey;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct Timers {
    deadlines: BTreeMap<TimerKey, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer; an existing deadline for the same key is replaced
    pub fn set(&mut self, key: TimerKey, at: Instant) {
        self.deadlines.insert(key, at);
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Cancel every timer whose key matches
    pub fn cancel_where<F: Fn(&TimerKey) -> bool>(&mut self, matches: F) {
        self.deadlines.retain(|key, _| !matches(key));
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the timers due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(Instant, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, key.clone()))
            .collect();
        due.sort();
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_core::IeeeAddr;
    use std::time::Duration;

    #[test]
    fn test_set_replaces_deadline() {
        let t0 = Instant::now();
        let key = TimerKey::AvailabilityDeadline(IeeeAddr::from_u64(1));
        let mut timers = Timers::new();
        timers.set(key.clone(), t0 + Duration::from_secs(5));
        timers.set(key.clone(), t0 + Duration::from_secs(10));
        assert_eq!(timers.len(), 1);
        assert!(timers.take_due(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(timers.take_due(t0 + Duration::from_secs(10)), vec![key]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_take_due_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.set(TimerKey::PersistState, t0 + Duration::from_secs(3));
        timers.set(TimerKey::OtaCheck(IeeeAddr::from_u64(1)), t0 + Duration::from_secs(1));
        timers.set(TimerKey::OtaCheck(IeeeAddr::from_u64(2)), t0 + Duration::from_secs(9));

        let due = timers.take_due(t0 + Duration::from_secs(4));
        assert_eq!(due, vec![TimerKey::OtaCheck(IeeeAddr::from_u64(1)), TimerKey::PersistState]);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_secs(9)));

        timers.cancel_where(|key| matches!(key, TimerKey::OtaCheck(_)));
        assert!(timers.is_empty());
    }
}
