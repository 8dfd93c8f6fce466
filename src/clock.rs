//! Deadline bookkeeping for the orchestrator. A pure sorted set keyed by
//! wall-clock time; the tick loop asks "what expired" instead of arming
//! per-deadline timers, so timer callbacks can never race trigger handling.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeadlineTag {
    /// Promoted reservation must confirm physical entry
    ReservationEntry,
    /// Advisory max-occupancy threshold
    MaxOccupancy,
    /// No PIR movement while occupied
    MovementWarning,
    /// Cancel everything and return to FREE
    DailyReset,
}

#[derive(Debug, Default)]
pub struct DeadlineSet {
    by_tag: BTreeMap<DeadlineTag, SystemTime>,
    ordered: BTreeSet<(SystemTime, DeadlineTag)>,
}

impl DeadlineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `tag` to fire at `at`. Re-arming an existing tag replaces the
    /// prior deadline atomically.
    pub fn schedule(&mut self, tag: DeadlineTag, at: SystemTime) {
        if let Some(prior) = self.by_tag.insert(tag, at) {
            self.ordered.remove(&(prior, tag));
        }
        self.ordered.insert((at, tag));
    }

    pub fn cancel(&mut self, tag: DeadlineTag) {
        if let Some(at) = self.by_tag.remove(&tag) {
            self.ordered.remove(&(at, tag));
        }
    }

    pub fn deadline(&self, tag: DeadlineTag) -> Option<SystemTime> {
        self.by_tag.get(&tag).copied()
    }

    pub fn next(&self) -> Option<SystemTime> {
        self.ordered.first().map(|(at, _)| *at)
    }

    /// Pop every deadline at or before `now`, in deadline order. A popped
    /// tag is gone; asking again is a no-op.
    pub fn expired(&mut self, now: SystemTime) -> Vec<DeadlineTag> {
        let mut due = Vec::new();
        while let Some(&(at, tag)) = self.ordered.first() {
            if at > now {
                break;
            }
            self.ordered.remove(&(at, tag));
            self.by_tag.remove(&tag);
            due.push(tag);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn expired_pops_due_tags_in_order() {
        let mut deadlines = DeadlineSet::new();
        deadlines.schedule(DeadlineTag::MaxOccupancy, at(20));
        deadlines.schedule(DeadlineTag::ReservationEntry, at(10));
        deadlines.schedule(DeadlineTag::DailyReset, at(100));

        let due = deadlines.expired(at(25));

        assert_eq!(
            due,
            vec![DeadlineTag::ReservationEntry, DeadlineTag::MaxOccupancy]
        );
        assert_eq!(deadlines.next(), Some(at(100)));
    }

    #[test]
    fn expired_is_idempotent() {
        let mut deadlines = DeadlineSet::new();
        deadlines.schedule(DeadlineTag::ReservationEntry, at(10));

        assert_eq!(
            deadlines.expired(at(10)),
            vec![DeadlineTag::ReservationEntry]
        );
        assert!(deadlines.expired(at(10)).is_empty());
        assert!(deadlines.expired(at(1000)).is_empty());
    }

    #[test]
    fn rearming_replaces_the_prior_deadline() {
        let mut deadlines = DeadlineSet::new();
        deadlines.schedule(DeadlineTag::MovementWarning, at(10));
        deadlines.schedule(DeadlineTag::MovementWarning, at(50));

        assert!(deadlines.expired(at(20)).is_empty());
        assert_eq!(deadlines.deadline(DeadlineTag::MovementWarning), Some(at(50)));
        assert_eq!(
            deadlines.expired(at(50)),
            vec![DeadlineTag::MovementWarning]
        );
    }

    #[test]
    fn cancel_removes_the_tag() {
        let mut deadlines = DeadlineSet::new();
        deadlines.schedule(DeadlineTag::ReservationEntry, at(10));
        deadlines.cancel(DeadlineTag::ReservationEntry);

        assert!(deadlines.is_empty());
        assert!(deadlines.expired(at(10)).is_empty());
    }
}
