//! Slave rotation scheduling.
//!
//! A [`SlaveSet`] names the stations a request fans out to, plus the spacing
//! between consecutive stations and between full cycles. The set is a plain
//! value; dispatching a request snapshots it into the ADU, so later caller
//! mutation never affects an in-flight rotation.

use crate::types::slave;

/// An ordered set of station addresses with rotation delays.
///
/// Membership is a 256-bit bitmap; iteration walks ids in increasing order.
/// When id 0 (broadcast) is a member it is exclusive: the rotation visits
/// only the broadcast address. With repetition enabled (a non-negative
/// repeat delay) the cursor wraps after the highest member, otherwise
/// [`SlaveSet::next`] returns [`slave::EOF`] once the set is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveSet {
    bits: [u64; 4],
    delay_ms: u32,
    repeat_delay_ms: i32,
    active: u8,
}

impl Default for SlaveSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveSet {
    /// Creates an empty set with zero inter-slave delay and no repetition.
    pub fn new() -> Self {
        Self::with_delays(0, -1)
    }

    /// Creates an empty set with the given delays.
    pub fn with_delays(delay_ms: u32, repeat_delay_ms: i32) -> Self {
        Self {
            bits: [0; 4],
            delay_ms,
            repeat_delay_ms,
            active: slave::BOF,
        }
    }

    /// Adds a station address.
    pub fn insert(&mut self, id: u8) -> crate::Result<()> {
        if !slave::is_valid(id) {
            return Err(crate::ModbusError::InvalidArgument);
        }
        self.bits[id as usize / 64] |= 1 << (id % 64);
        Ok(())
    }

    /// Removes a station address.
    pub fn remove(&mut self, id: u8) {
        if slave::is_valid(id) {
            self.bits[id as usize / 64] &= !(1 << (id % 64));
        }
    }

    /// Membership test.
    pub fn contains(&self, id: u8) -> bool {
        id <= slave::MAX && self.bits[id as usize / 64] & (1 << (id % 64)) != 0
    }

    /// Returns whether no station is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of stations in the set.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns whether the set targets the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.contains(slave::BROADCAST)
    }

    /// Spacing between consecutive stations of one cycle, in milliseconds.
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    /// Spacing between cycles in milliseconds; negative disables repetition.
    pub fn repeat_delay_ms(&self) -> i32 {
        self.repeat_delay_ms
    }

    /// Returns whether the rotation restarts after the last station.
    pub fn repeat_enabled(&self) -> bool {
        self.repeat_delay_ms >= 0
    }

    /// The station most recently produced, [`slave::BOF`] before the first.
    pub fn active(&self) -> u8 {
        self.active
    }

    /// Restarts iteration from the beginning.
    pub fn rewind(&mut self) {
        self.active = slave::BOF;
    }

    /// Advances to the next station.
    ///
    /// Returns [`slave::EOF`] when the set is empty or exhausted with
    /// repetition disabled.
    pub fn next(&mut self) -> u8 {
        if self.is_broadcast() {
            if self.active == slave::BOF {
                self.active = slave::BROADCAST;
                return slave::BROADCAST;
            }
            if self.repeat_enabled() {
                return slave::BROADCAST;
            }
            return slave::EOF;
        }
        let start = match self.active {
            slave::BOF => 0,
            id => id as usize + 1,
        };
        if let Some(id) = self.scan(start) {
            self.active = id;
            return id;
        }
        if self.repeat_enabled() {
            if let Some(id) = self.scan(0) {
                self.active = id;
                return id;
            }
        }
        slave::EOF
    }

    /// Iterates members in increasing order without moving the cursor.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=slave::MAX).filter(move |id| self.contains(*id))
    }

    fn scan(&self, start: usize) -> Option<u8> {
        (start..=slave::MAX as usize).find_map(|id| {
            if self.bits[id / 64] & (1 << (id % 64)) != 0 {
                Some(id as u8)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_contains() {
        let mut set = SlaveSet::new();
        set.insert(1).expect("valid");
        set.insert(100).expect("valid");
        set.insert(247).expect("valid");
        assert!(set.contains(1));
        assert!(set.contains(100));
        assert!(set.contains(247));
        assert!(!set.contains(2));
        assert_eq!(set.len(), 3);
        assert!(set.insert(248).is_err());
    }

    #[test]
    fn test_iteration_stops_without_repeat() {
        let mut set = SlaveSet::new();
        for id in [3, 1, 7] {
            set.insert(id).expect("valid");
        }
        assert_eq!(set.next(), 1);
        assert_eq!(set.next(), 3);
        assert_eq!(set.next(), 7);
        assert_eq!(set.next(), slave::EOF);
        assert_eq!(set.next(), slave::EOF);
    }

    #[test]
    fn test_iteration_wraps_with_repeat() {
        let mut set = SlaveSet::with_delays(0, 1000);
        for id in [2, 5] {
            set.insert(id).expect("valid");
        }
        assert_eq!(set.next(), 2);
        assert_eq!(set.next(), 5);
        assert_eq!(set.next(), 2);
        assert_eq!(set.next(), 5);
    }

    #[test]
    fn test_single_member_cycles() {
        let mut set = SlaveSet::with_delays(0, 500);
        set.insert(9).expect("valid");
        assert_eq!(set.next(), 9);
        assert_eq!(set.next(), 9);
    }

    #[test]
    fn test_broadcast_is_exclusive() {
        let mut set = SlaveSet::with_delays(0, 1000);
        set.insert(0).expect("valid");
        set.insert(5).expect("valid");
        assert_eq!(set.next(), slave::BROADCAST);
        assert_eq!(set.next(), slave::BROADCAST);
    }

    #[test]
    fn test_broadcast_once_without_repeat() {
        let mut set = SlaveSet::new();
        set.insert(0).expect("valid");
        assert_eq!(set.next(), slave::BROADCAST);
        assert_eq!(set.next(), slave::EOF);
    }

    #[test]
    fn test_empty_set_is_eof() {
        let mut set = SlaveSet::with_delays(0, 1000);
        assert_eq!(set.next(), slave::EOF);
    }

    #[test]
    fn test_rewind() {
        let mut set = SlaveSet::new();
        set.insert(4).expect("valid");
        assert_eq!(set.next(), 4);
        assert_eq!(set.next(), slave::EOF);
        set.rewind();
        assert_eq!(set.active(), slave::BOF);
        assert_eq!(set.next(), 4);
    }

    proptest! {
        #[test]
        fn prop_iteration_matches_membership(ids in proptest::collection::btree_set(1u8..=247, 1..16)) {
            let mut set = SlaveSet::new();
            for id in &ids {
                set.insert(*id).unwrap();
            }
            // iter() yields exactly the members in increasing order.
            let listed: Vec<u8> = set.iter().collect();
            let expected: Vec<u8> = ids.iter().copied().collect();
            prop_assert_eq!(&listed, &expected);
            // next() walks the same sequence, then reports EOF.
            let mut walked = Vec::new();
            loop {
                match set.next() {
                    slave::EOF => break,
                    id => walked.push(id),
                }
            }
            prop_assert_eq!(&walked, &expected);
        }
    }
}
