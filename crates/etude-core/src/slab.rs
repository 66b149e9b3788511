// src/slab.rs
use crate::conn::{ConnState, Connection};

const NONE: usize = usize::MAX;
const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// One entry of the table. While a worker holds the connection `conn` is
/// `None` and `state` is `Processing`.
#[derive(Default)]
pub struct Slot {
    pub state: ConnState,
    pub conn: Option<Box<Connection>>,
    /// Timer fired while the connection was away in a worker.
    pub close_pending: bool,
    generation: u32,
    next_free: usize,
}

/// Fixed-capacity connection table with an intrusive free list.
///
/// Tokens handed to epoll and the timer carry the slot index in the low
/// 32 bits and the slot generation in the high bits, so an event for a
/// recycled slot is recognised as stale.
pub struct ConnTable {
    slots: Box<[Slot]>,
    head_free: usize,
    active: usize,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot {
                next_free: if i + 1 == capacity { NONE } else { i + 1 },
                ..Slot::default()
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            head_free: if capacity == 0 { NONE } else { 0 },
            active: 0,
        }
    }

    /// Store `conn` in a free slot and return its token, or hand the
    /// connection back when the table is full.
    pub fn allocate(&mut self, conn: Box<Connection>) -> Result<u64, Box<Connection>> {
        if self.head_free == NONE {
            return Err(conn);
        }
        let idx = self.head_free;
        let slot = &mut self.slots[idx];
        self.head_free = slot.next_free;

        slot.next_free = NONE;
        slot.state = ConnState::Accepted;
        slot.conn = Some(conn);
        slot.close_pending = false;
        self.active += 1;
        Ok(encode(idx, slot.generation))
    }

    /// Release the slot for `token`, returning whatever connection it still
    /// holds. Stale tokens are ignored.
    pub fn free(&mut self, token: u64) -> Option<Box<Connection>> {
        let idx = self.index_of(token)?;
        let slot = &mut self.slots[idx];
        let conn = slot.conn.take();

        slot.state = ConnState::Free;
        slot.close_pending = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.head_free;
        self.head_free = idx;
        self.active -= 1;
        conn
    }

    /// Move the connection out for a worker task.
    pub fn take(&mut self, token: u64) -> Option<Box<Connection>> {
        let slot = self.get_mut(token)?;
        let conn = slot.conn.take()?;
        slot.state = ConnState::Processing;
        Some(conn)
    }

    /// Put a connection back after its task finished.
    pub fn restore(&mut self, token: u64, conn: Box<Connection>) -> Result<(), Box<Connection>> {
        match self.get_mut(token) {
            Some(slot) if slot.conn.is_none() => {
                slot.conn = Some(conn);
                Ok(())
            }
            _ => Err(conn),
        }
    }

    pub fn get_mut(&mut self, token: u64) -> Option<&mut Slot> {
        let idx = self.index_of(token)?;
        Some(&mut self.slots[idx])
    }

    pub fn get(&self, token: u64) -> Option<&Slot> {
        let idx = self.index_of(token)?;
        Some(&self.slots[idx])
    }

    /// Tokens of every occupied slot.
    pub fn tokens(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != ConnState::Free)
            .map(|(i, s)| encode(i, s.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn is_full(&self) -> bool {
        self.head_free == NONE
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index_of(&self, token: u64) -> Option<usize> {
        let (idx, generation) = decode(token);
        let slot = self.slots.get(idx)?;
        (slot.state != ConnState::Free && slot.generation == generation).then_some(idx)
    }
}

pub fn encode(index: usize, generation: u32) -> u64 {
    ((generation as u64) << INDEX_BITS) | (index as u64 & INDEX_MASK)
}

pub fn decode(token: u64) -> (usize, u32) {
    ((token & INDEX_MASK) as usize, (token >> INDEX_BITS) as u32)
}
