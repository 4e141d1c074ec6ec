//! Admission queue: highest priority first, FIFO within a priority.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet, VecDeque};

#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    lanes: BTreeMap<Reverse<i64>, VecDeque<i64>>,
    members: HashSet<i64>,
}

impl AdmissionQueue {
    /// Appends `id` to its priority lane; returns false if it was already queued.
    pub(crate) fn push(&mut self, id: i64, priority: i64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.lanes.entry(Reverse(priority)).or_default().push_back(id);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<i64> {
        let mut lane = self.lanes.first_entry()?;
        let id = lane.get_mut().pop_front();
        if lane.get().is_empty() {
            lane.remove();
        }
        if let Some(id) = id {
            self.members.remove(&id);
        }
        id
    }

    pub(crate) fn remove(&mut self, id: i64) -> bool {
        if !self.members.remove(&id) {
            return false;
        }
        self.lanes.retain(|_, lane| {
            lane.retain(|queued| *queued != id);
            !lane.is_empty()
        });
        true
    }

    pub(crate) fn contains(&self, id: i64) -> bool {
        self.members.contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = AdmissionQueue::default();
        queue.push(3, 0);
        queue.push(1, 0);
        queue.push(2, 0);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_higher_priority_admitted_first() {
        let mut queue = AdmissionQueue::default();
        queue.push(1, 0);
        queue.push(2, 5);
        queue.push(3, -1);
        queue.push(4, 5);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_push_is_ignored() {
        let mut queue = AdmissionQueue::default();
        assert!(queue.push(1, 0));
        assert!(!queue.push(1, 9));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn test_remove_drops_id_and_empty_lane() {
        let mut queue = AdmissionQueue::default();
        queue.push(1, 2);
        queue.push(2, 0);
        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert!(!queue.contains(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }
}
