// src/slab.rs
use std::sync::{Arc, Mutex};

use crate::timer::TimerId;

/// Stable handle to an occupied slab slot. The generation makes a handle
/// to a freed (and possibly reused) slot detectably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub index: u32,
    pub generation: u32,
}

impl Token {
    /// Pack into the 64-bit epoll user-data word.
    #[inline(always)]
    pub fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline(always)]
    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// One arena entry. The connection storage is created the first time the
/// slot is used and kept (and re-initialized by the owner) afterwards.
pub struct Slot<C> {
    conn: Option<Arc<Mutex<C>>>,
    generation: u32,
    occupied: bool,
    next_free: Option<usize>,
    /// Idle timer owned by the dispatcher.
    pub timer: Option<TimerId>,
    /// Set while a worker holds the connection.
    pub checked_out: bool,
}

impl<C> Slot<C> {
    fn empty(next_free: Option<usize>) -> Self {
        Self {
            conn: None,
            generation: 0,
            occupied: false,
            next_free,
            timer: None,
            checked_out: false,
        }
    }

    pub fn conn(&self) -> &Arc<Mutex<C>> {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("occupied slot without connection storage"),
        }
    }
}

/// Fixed-capacity connection table with O(1) allocate/free.
pub struct ConnectionSlab<C> {
    entries: Box<[Slot<C>]>,
    head_free: Option<usize>,
    active_count: usize,
}

impl<C> ConnectionSlab<C> {
    /// Size the table strictly once; slots never move afterwards.
    pub fn new(capacity: usize) -> Self {
        let entries: Vec<Slot<C>> = (0..capacity)
            .map(|i| Slot::empty(if i + 1 < capacity { Some(i + 1) } else { None }))
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            head_free: if capacity > 0 { Some(0) } else { None },
            active_count: 0,
        }
    }

    /// Take a free slot. `init` builds the connection storage on the slot's
    /// first use only. Returns `None` at capacity.
    pub fn allocate(&mut self, init: impl FnOnce() -> C) -> Option<Token> {
        let idx = self.head_free?;
        let slot = &mut self.entries[idx];

        self.head_free = slot.next_free.take();
        slot.occupied = true;
        slot.timer = None;
        slot.checked_out = false;
        if slot.conn.is_none() {
            slot.conn = Some(Arc::new(Mutex::new(init())));
        }

        self.active_count += 1;
        Some(Token {
            index: idx as u32,
            generation: slot.generation,
        })
    }

    /// Return a slot to the free list. Stale or double frees are ignored.
    pub fn free(&mut self, token: Token) -> bool {
        let head_free = self.head_free;
        let Some(slot) = self.lookup_mut(token) else {
            return false;
        };

        slot.occupied = false;
        slot.timer = None;
        slot.checked_out = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = head_free;

        self.head_free = Some(token.index as usize);
        self.active_count -= 1;
        true
    }

    #[inline(always)]
    pub fn get(&self, token: Token) -> Option<&Slot<C>> {
        self.entries
            .get(token.index as usize)
            .filter(|slot| slot.occupied && slot.generation == token.generation)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Slot<C>> {
        self.lookup_mut(token)
    }

    /// Tokens of every occupied slot.
    pub fn tokens(&self) -> Vec<Token> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.occupied)
            .map(|(i, slot)| Token {
                index: i as u32,
                generation: slot.generation,
            })
            .collect()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.head_free.is_none()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn lookup_mut(&mut self, token: Token) -> Option<&mut Slot<C>> {
        self.entries
            .get_mut(token.index as usize)
            .filter(|slot| slot.occupied && slot.generation == token.generation)
    }
}
