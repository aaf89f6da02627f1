// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timer tree
//!
//! Ordered map keyed by `(deadline, seq)`: deadlines in monotonic
//! milliseconds, `seq` a monotone insertion counter so equal deadlines fire
//! in insertion order. Insert and remove are O(log n); the nearest deadline
//! is the leftmost key.

use std::collections::BTreeMap;

use super::EventId;

/// Key handed back on insert; an armed event stores it for O(log n) removal.
pub type TimerKey = (u64, u64);

#[derive(Debug, Default)]
pub struct TimerTree {
    tree: BTreeMap<TimerKey, EventId>,
    seq: u64,
}

impl TimerTree {
    pub fn new() -> Self {
        TimerTree::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Arm a timer at an absolute deadline. The caller must not insert an
    /// event that is already armed; re-arming goes through remove first.
    pub fn insert(&mut self, deadline: u64, event: EventId) -> TimerKey {
        let key = (deadline, self.seq);
        self.seq += 1;
        let displaced = self.tree.insert(key, event);
        debug_assert!(displaced.is_none());
        key
    }

    pub fn remove(&mut self, key: TimerKey) {
        self.tree.remove(&key);
    }

    /// Milliseconds until the nearest deadline, `None` when no timer is set.
    pub fn next_timeout(&self, now: u64) -> Option<u64> {
        self.tree
            .first_key_value()
            .map(|((deadline, _), _)| deadline.saturating_sub(now))
    }

    /// Pop the nearest timer if it has expired.
    pub fn pop_expired(&mut self, now: u64) -> Option<EventId> {
        let (&(deadline, seq), _) = self.tree.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.tree.remove(&(deadline, seq))
    }
}

#[cfg(test)]
mod test {
    use super::TimerTree;
    use crate::event::EventId;

    fn ev(cid: usize) -> EventId {
        EventId {
            cid,
            write: false,
            gen: 0,
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timers = TimerTree::new();
        timers.insert(300, ev(3));
        timers.insert(100, ev(1));
        timers.insert(200, ev(2));

        let mut fired = Vec::new();
        while let Some(e) = timers.pop_expired(1000) {
            fired.push(e.cid);
        }
        assert_eq!(vec![1, 2, 3], fired);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut timers = TimerTree::new();
        timers.insert(100, ev(7));
        timers.insert(100, ev(8));
        timers.insert(100, ev(9));

        let mut fired = Vec::new();
        while let Some(e) = timers.pop_expired(100) {
            fired.push(e.cid);
        }
        assert_eq!(vec![7, 8, 9], fired);
    }

    #[test]
    fn unexpired_timers_stay_armed() {
        let mut timers = TimerTree::new();
        timers.insert(500, ev(1));
        assert!(timers.pop_expired(499).is_none());
        assert_eq!(Some(1), timers.next_timeout(499));
        assert_eq!(1, timers.len());
    }

    #[test]
    fn removal_by_key_disarms() {
        let mut timers = TimerTree::new();
        let key = timers.insert(100, ev(1));
        timers.remove(key);
        assert!(timers.pop_expired(100).is_none());
    }
}
