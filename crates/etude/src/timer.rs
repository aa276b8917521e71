// src/timer.rs
//! Idle-connection timers.
//!
//! An ascending doubly-linked list threaded through an arena: links are
//! indices, "delete" returns the slot to a free list, and a stale
//! [`TimerId`] can never reach freed memory.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// What the owner of an expired record decided to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The payload was torn down; the record is deleted.
    Evicted,
    /// The payload is still in use; keep the record with a new deadline.
    Postpone(Instant),
}

/// Capability invoked by [`TimerList::tick`] for each expired record.
pub trait Evict<P> {
    fn evict(&mut self, payload: P) -> Verdict;
}

#[derive(Debug)]
struct Node<P> {
    expire: Instant,
    payload: P,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
enum Entry<P> {
    Occupied(Node<P>),
    Vacant(Option<usize>),
}

#[derive(Debug)]
pub struct TimerList<P> {
    entries: Vec<Entry<P>>,
    free: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<P> Default for TimerList<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> TimerList<P> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free: None,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        match self.entries.get(id.0) {
            Some(Entry::Occupied(node)) => Some(node.expire),
            _ => None,
        }
    }

    /// Earliest deadline in the list.
    pub fn first(&self) -> Option<Instant> {
        self.head.map(|h| self.node(h).expire)
    }

    /// Insert a record. O(1) when it becomes the new head, otherwise a scan
    /// from the head for the first later deadline.
    pub fn add(&mut self, expire: Instant, payload: P) -> TimerId {
        let node = Node {
            expire,
            payload,
            prev: None,
            next: None,
        };
        let idx = match self.free {
            Some(idx) => {
                self.free = match self.entries[idx] {
                    Entry::Vacant(next) => next,
                    Entry::Occupied(_) => unreachable!("free list points at a live timer"),
                };
                self.entries[idx] = Entry::Occupied(node);
                idx
            }
            None => {
                self.entries.push(Entry::Occupied(node));
                self.entries.len() - 1
            }
        };
        self.len += 1;
        self.link_from(idx, self.head);
        TimerId(idx)
    }

    /// Push `id`'s deadline out to `expire`. The record only ever moves
    /// towards the tail, so the scan starts at its current successor.
    /// Returns `false` for an unknown id.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        if !self.contains(id) {
            return false;
        }
        let idx = id.0;
        let old = self.node(idx).expire;
        self.node_mut(idx).expire = expire;

        if expire < old {
            // Deadlines are not supposed to move backwards; rescan from the head.
            self.unlink(idx);
            self.link_from(idx, self.head);
            return true;
        }

        let next = self.node(idx).next;
        match next {
            None => {}
            Some(n) if expire <= self.node(n).expire => {}
            Some(n) => {
                self.unlink(idx);
                self.link_from(idx, Some(n));
            }
        }
        true
    }

    /// Delete a record, handing back its payload.
    pub fn remove(&mut self, id: TimerId) -> Option<P> {
        if !self.contains(id) {
            return None;
        }
        self.unlink(id.0);
        Some(self.release(id.0))
    }

    /// Evict every record whose deadline is at or before `now`, earliest
    /// first, stopping at the first one still in the future. Records the
    /// evictor postpones are re-inserted after the sweep. Returns how many
    /// records were deleted.
    pub fn tick<E: Evict<P>>(&mut self, now: Instant, evictor: &mut E) -> usize
    where
        P: Copy,
    {
        let mut evicted = 0;
        let mut postponed = Vec::new();

        while let Some(head) = self.head {
            if self.node(head).expire > now {
                break;
            }
            let payload = self.node(head).payload;
            self.unlink(head);
            match evictor.evict(payload) {
                Verdict::Evicted => {
                    self.release(head);
                    evicted += 1;
                }
                Verdict::Postpone(at) => {
                    self.node_mut(head).expire = at;
                    postponed.push(head);
                }
            }
        }

        for idx in postponed {
            self.link_from(idx, self.head);
        }
        evicted
    }

    /// Remove every record, returning the payloads in deadline order.
    pub fn drain(&mut self) -> Vec<P> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(head) = self.head {
            self.unlink(head);
            out.push(self.release(head));
        }
        self.entries.clear();
        self.free = None;
        out
    }

    /// Deadlines from head to tail.
    pub fn deadlines(&self) -> Vec<Instant> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = self.node(idx);
            out.push(node.expire);
            cur = node.next;
        }
        out
    }

    fn contains(&self, id: TimerId) -> bool {
        matches!(self.entries.get(id.0), Some(Entry::Occupied(_)))
    }

    fn node(&self, idx: usize) -> &Node<P> {
        match &self.entries[idx] {
            Entry::Occupied(node) => node,
            Entry::Vacant(_) => unreachable!("timer link points at a free slot"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<P> {
        match &mut self.entries[idx] {
            Entry::Occupied(node) => node,
            Entry::Vacant(_) => unreachable!("timer link points at a free slot"),
        }
    }

    /// Link the detached node `idx` in front of the first node, scanning
    /// from `start`, whose deadline is strictly later. Equal deadlines keep
    /// insertion order.
    fn link_from(&mut self, idx: usize, start: Option<usize>) {
        let expire = self.node(idx).expire;
        let mut cur = start;
        while let Some(c) = cur {
            if self.node(c).expire > expire {
                break;
            }
            cur = self.node(c).next;
        }

        match cur {
            Some(succ) => {
                let prev = self.node(succ).prev;
                {
                    let node = self.node_mut(idx);
                    node.prev = prev;
                    node.next = Some(succ);
                }
                self.node_mut(succ).prev = Some(idx);
                match prev {
                    Some(p) => self.node_mut(p).next = Some(idx),
                    None => self.head = Some(idx),
                }
            }
            None => {
                let prev = self.tail;
                {
                    let node = self.node_mut(idx);
                    node.prev = prev;
                    node.next = None;
                }
                match prev {
                    Some(p) => self.node_mut(p).next = Some(idx),
                    None => self.head = Some(idx),
                }
                self.tail = Some(idx);
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    /// Return a detached slot to the free list.
    fn release(&mut self, idx: usize) -> P {
        let entry = std::mem::replace(&mut self.entries[idx], Entry::Vacant(self.free));
        self.free = Some(idx);
        self.len -= 1;
        match entry {
            Entry::Occupied(node) => node.payload,
            Entry::Vacant(_) => unreachable!("released a free timer slot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    fn assert_sorted<P>(list: &TimerList<P>) {
        let deadlines = list.deadlines();
        assert_eq!(deadlines.len(), list.len());
        assert!(deadlines.windows(2).all(|w| w[0] <= w[1]), "{deadlines:?}");
    }

    struct Recorder {
        seen: Vec<u32>,
        keep: Option<(u32, Instant)>,
    }

    impl Evict<u32> for Recorder {
        fn evict(&mut self, payload: u32) -> Verdict {
            self.seen.push(payload);
            match self.keep {
                Some((id, until)) if id == payload => Verdict::Postpone(until),
                _ => Verdict::Evicted,
            }
        }
    }

    #[test]
    fn add_keeps_order() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.add(at(base, 30), 3);
        list.add(at(base, 10), 1);
        list.add(at(base, 20), 2);
        list.add(at(base, 40), 4);
        assert_sorted(&list);
        assert_eq!(list.first(), Some(at(base, 10)));
    }

    #[test]
    fn adjust_moves_towards_tail() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let a = list.add(at(base, 10), 1);
        list.add(at(base, 20), 2);
        list.add(at(base, 30), 3);

        assert!(list.adjust(a, at(base, 25)));
        assert_sorted(&list);
        assert_eq!(list.first(), Some(at(base, 20)));
        assert_eq!(list.deadline(a), Some(at(base, 25)));

        assert!(list.adjust(a, at(base, 99)));
        assert_eq!(list.deadlines().last(), Some(&at(base, 99)));
    }

    #[test]
    fn remove_head_tail_and_interior() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let a = list.add(at(base, 1), 1);
        let b = list.add(at(base, 2), 2);
        let c = list.add(at(base, 3), 3);
        let d = list.add(at(base, 4), 4);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(d), Some(4));
        assert_eq!(list.deadlines(), vec![at(base, 3)]);
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert_eq!(list.first(), None);

        // Stale ids are harmless.
        assert_eq!(list.remove(c), None);
        assert!(!list.adjust(a, at(base, 9)));
    }

    #[test]
    fn tick_evicts_exactly_the_expired_prefix() {
        let base = Instant::now();
        let mut list = TimerList::new();
        for (secs, id) in [(5, 5), (1, 1), (3, 3), (4, 4), (2, 2)] {
            list.add(at(base, secs), id);
        }

        let mut rec = Recorder {
            seen: vec![],
            keep: None,
        };
        assert_eq!(list.tick(at(base, 3), &mut rec), 3);
        assert_eq!(rec.seen, vec![1, 2, 3]);
        assert_eq!(list.deadlines(), vec![at(base, 4), at(base, 5)]);

        assert_eq!(list.tick(at(base, 3), &mut rec), 0);
    }

    #[test]
    fn tick_reinserts_postponed_records() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let busy = list.add(at(base, 1), 1);
        list.add(at(base, 2), 2);
        list.add(at(base, 8), 8);

        let mut rec = Recorder {
            seen: vec![],
            keep: Some((1, at(base, 6))),
        };
        assert_eq!(list.tick(at(base, 2), &mut rec), 1);
        assert_eq!(rec.seen, vec![1, 2]);
        assert_eq!(list.deadline(busy), Some(at(base, 6)));
        assert_eq!(list.deadlines(), vec![at(base, 6), at(base, 8)]);
    }

    #[test]
    fn random_interleavings_stay_sorted() {
        let base = Instant::now();
        let mut list = TimerList::new();
        let mut live: Vec<TimerId> = Vec::new();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for step in 0..2_000u32 {
            match next() % 4 {
                0 | 1 => live.push(list.add(at(base, next() % 500), step)),
                2 if !live.is_empty() => {
                    let id = live[(next() as usize) % live.len()];
                    let old = list.deadline(id).unwrap();
                    list.adjust(id, old + Duration::from_secs(next() % 100));
                }
                3 if !live.is_empty() => {
                    let id = live.swap_remove((next() as usize) % live.len());
                    assert!(list.remove(id).is_some());
                }
                _ => {}
            }
            assert_sorted(&list);
        }

        let cutoff = at(base, 250);
        let expected = list.deadlines().iter().filter(|d| **d <= cutoff).count();
        let mut rec = Recorder {
            seen: vec![],
            keep: None,
        };
        assert_eq!(list.tick(cutoff, &mut rec), expected);
        assert_sorted(&list);
        assert!(list.first().is_none_or(|d| d > cutoff));
    }

    #[test]
    fn drain_empties_and_slots_are_reused() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.add(at(base, 2), 2);
        list.add(at(base, 1), 1);
        assert_eq!(list.drain(), vec![1, 2]);
        assert!(list.is_empty());

        let a = list.add(at(base, 1), 1);
        list.remove(a);
        let b = list.add(at(base, 1), 1);
        assert_eq!(a, b);
    }
}
