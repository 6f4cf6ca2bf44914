//! ADU lifecycle: pool, pending queue, sent window.
//!
//! Every capacity here is fixed when the engine is created; steady-state
//! operation recycles the same slots and never allocates.

use std::collections::VecDeque;

use crate::error::ModbusError;
use crate::protocol::Pdu;
use crate::scheduler::SlaveSet;
use crate::types::slave;

use super::Callback;

/// One application data unit: a PDU plus its dispatch state.
pub struct Adu<C> {
    /// Inner protocol data unit
    pub pdu: Pdu,
    /// Addressed station
    pub slave: u8,
    /// Rotation snapshot, if the request fans out over a slave set
    pub slaves: Option<SlaveSet>,
    /// Completion callback
    pub callback: Option<Callback<C>>,
    /// Slot occupancy
    pub in_use: bool,
    /// When the ADU entered the pending queue
    pub queued_at_us: u64,
    /// Scheduled holdoff before transmission
    pub delay_us: u64,
}

impl<C> Adu<C> {
    pub(crate) fn new(pdu_size: usize) -> Self {
        Self {
            pdu: Pdu::new(pdu_size),
            slave: slave::NULL,
            slaves: None,
            callback: None,
            in_use: false,
            queued_at_us: 0,
            delay_us: 0,
        }
    }

    /// Earliest instant the ADU may be transmitted.
    pub fn ready_at_us(&self) -> u64 {
        self.queued_at_us + self.delay_us
    }

    fn recycle(&mut self) {
        self.pdu.clear();
        self.slave = slave::NULL;
        self.slaves = None;
        self.callback = None;
        self.in_use = false;
        self.queued_at_us = 0;
        self.delay_us = 0;
    }
}

/// Fixed-size pool of preallocated ADUs.
pub struct AduPool<C> {
    slots: Vec<Adu<C>>,
}

impl<C> AduPool<C> {
    pub fn new(capacity: usize, pdu_size: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Adu::new(pdu_size)).collect(),
        }
    }

    /// Marks the first free slot used and returns its index.
    pub fn acquire(&mut self) -> Option<usize> {
        let index = self.slots.iter().position(|slot| !slot.in_use)?;
        self.slots[index].in_use = true;
        Some(index)
    }

    /// Returns a slot to the pool.
    pub fn release(&mut self, index: usize) {
        self.slots[index].recycle();
    }

    pub fn get(&self, index: usize) -> &Adu<C> {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Adu<C> {
        &mut self.slots[index]
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently dispensed.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }

    /// Releases every slot without invoking callbacks.
    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            slot.recycle();
        }
    }
}

/// Fixed-capacity queue of pool indices awaiting transmission.
///
/// Selection is not FIFO: among the entries whose `queued_at + delay` has
/// elapsed, the smallest delay wins. The chosen entry is swapped to the head
/// and dequeued.
pub struct PendingQueue {
    items: VecDeque<usize>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, index: usize) -> crate::Result<()> {
        if self.items.len() >= self.capacity {
            return Err(ModbusError::QueueFull);
        }
        self.items.push_back(index);
        Ok(())
    }

    /// Dequeues the ready entry with the smallest scheduled delay.
    pub fn pop_ready<C>(&mut self, pool: &AduPool<C>, now_us: u64) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (position, index) in self.items.iter().enumerate() {
            let adu = pool.get(*index);
            if adu.ready_at_us() > now_us {
                continue;
            }
            match best {
                Some((_, delay)) if adu.delay_us >= delay => {}
                _ => best = Some((position, adu.delay_us)),
            }
        }
        let (position, _) = best?;
        self.items.swap(0, position);
        self.items.pop_front()
    }

    /// Dequeues the head entry regardless of its schedule.
    pub fn pop_front(&mut self) -> Option<usize> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// An outstanding TCP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentEntry {
    /// Pool index of the transmitted ADU
    pub adu: usize,
    /// Transaction id it was sent under
    pub transaction_id: u16,
    /// Transmission timestamp
    pub sent_at_ms: u64,
}

/// Fixed-capacity window of transmitted, unanswered requests.
pub struct SentWindow {
    entries: Vec<Option<SentEntry>>,
}

impl SentWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
        }
    }

    pub fn insert(&mut self, entry: SentEntry) -> crate::Result<()> {
        for slot in &mut self.entries {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(());
            }
        }
        Err(ModbusError::SentBufferFull)
    }

    /// Removes and returns the entry sent under `transaction_id`.
    pub fn take_by_transaction(&mut self, transaction_id: u16) -> Option<SentEntry> {
        self.entries
            .iter_mut()
            .find(|slot| {
                matches!(slot, Some(entry) if entry.transaction_id == transaction_id)
            })?
            .take()
    }

    /// Removes and returns the oldest entry (single-in-flight mode).
    pub fn take_oldest(&mut self) -> Option<SentEntry> {
        let position = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|entry| (i, entry.sent_at_ms)))
            .min_by_key(|(_, sent_at)| *sent_at)
            .map(|(i, _)| i)?;
        self.entries[position].take()
    }

    /// Removes and returns the next entry whose budget has elapsed.
    pub fn take_expired(&mut self, now_ms: u64, timeout_ms: u64) -> Option<SentEntry> {
        let position = self.entries.iter().position(|slot| {
            matches!(slot, Some(entry) if now_ms.saturating_sub(entry.sent_at_ms) >= timeout_ms)
        })?;
        self.entries[position].take()
    }

    pub fn has_space(&self) -> bool {
        self.entries.iter().any(|slot| slot.is_none())
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for slot in &mut self.entries {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestPool = AduPool<()>;

    #[test]
    fn test_pool_acquire_release() {
        let mut pool: TestPool = AduPool::new(2, 32);
        let a = pool.acquire().expect("slot");
        let b = pool.acquire().expect("slot");
        assert_ne!(a, b);
        assert_eq!(pool.acquire(), None);
        pool.release(a);
        assert_eq!(pool.acquire(), Some(a));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_queue_capacity() {
        let mut queue = PendingQueue::new(2);
        queue.push(0).expect("room");
        queue.push(1).expect("room");
        assert_eq!(queue.push(2), Err(ModbusError::QueueFull));
    }

    #[test]
    fn test_pop_ready_honors_delay() {
        let mut pool: TestPool = AduPool::new(2, 32);
        let a = pool.acquire().expect("slot");
        let b = pool.acquire().expect("slot");
        pool.get_mut(a).queued_at_us = 0;
        pool.get_mut(a).delay_us = 5_000;
        pool.get_mut(b).queued_at_us = 0;
        pool.get_mut(b).delay_us = 0;

        let mut queue = PendingQueue::new(4);
        queue.push(a).expect("room");
        queue.push(b).expect("room");

        // Only b is ready at t=0.
        assert_eq!(queue.pop_ready(&pool, 0), Some(b));
        assert_eq!(queue.pop_ready(&pool, 0), None);
        assert_eq!(queue.pop_ready(&pool, 5_000), Some(a));
    }

    #[test]
    fn test_pop_ready_smallest_delay_wins() {
        // Both entries are past due; the smaller scheduled delay is chosen
        // even though the other was queued first.
        let mut pool: TestPool = AduPool::new(2, 32);
        let first = pool.acquire().expect("slot");
        let second = pool.acquire().expect("slot");
        pool.get_mut(first).queued_at_us = 0;
        pool.get_mut(first).delay_us = 3_000;
        pool.get_mut(second).queued_at_us = 1_000;
        pool.get_mut(second).delay_us = 1_000;

        let mut queue = PendingQueue::new(4);
        queue.push(first).expect("room");
        queue.push(second).expect("room");

        assert_eq!(queue.pop_ready(&pool, 10_000), Some(second));
        assert_eq!(queue.pop_ready(&pool, 10_000), Some(first));
    }

    #[test]
    fn test_sent_window() {
        let mut window = SentWindow::new(2);
        window
            .insert(SentEntry {
                adu: 0,
                transaction_id: 7,
                sent_at_ms: 100,
            })
            .expect("room");
        window
            .insert(SentEntry {
                adu: 1,
                transaction_id: 8,
                sent_at_ms: 110,
            })
            .expect("room");
        assert_eq!(
            window.insert(SentEntry {
                adu: 2,
                transaction_id: 9,
                sent_at_ms: 120,
            }),
            Err(ModbusError::SentBufferFull)
        );

        let entry = window.take_by_transaction(8).expect("found");
        assert_eq!(entry.adu, 1);
        assert_eq!(window.take_by_transaction(8), None);
        assert!(window.has_space());
    }

    #[test]
    fn test_sent_window_expiry() {
        let mut window = SentWindow::new(2);
        window
            .insert(SentEntry {
                adu: 0,
                transaction_id: 1,
                sent_at_ms: 0,
            })
            .expect("room");
        window
            .insert(SentEntry {
                adu: 1,
                transaction_id: 2,
                sent_at_ms: 900,
            })
            .expect("room");

        assert_eq!(window.take_expired(1_000, 1_000).map(|e| e.adu), Some(0));
        assert_eq!(window.take_expired(1_000, 1_000), None);
        assert_eq!(window.take_expired(1_900, 1_000).map(|e| e.adu), Some(1));
    }

    #[test]
    fn test_take_oldest() {
        let mut window = SentWindow::new(2);
        window
            .insert(SentEntry {
                adu: 5,
                transaction_id: 2,
                sent_at_ms: 50,
            })
            .expect("room");
        window
            .insert(SentEntry {
                adu: 6,
                transaction_id: 1,
                sent_at_ms: 40,
            })
            .expect("room");
        assert_eq!(window.take_oldest().map(|e| e.adu), Some(6));
        assert_eq!(window.take_oldest().map(|e| e.adu), Some(5));
        assert_eq!(window.take_oldest(), None);
    }
}
