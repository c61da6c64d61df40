//! A fixed-capacity FIFO backed by a slot vector that grows on demand up to the capacity. It is
//!  the building block for every queue in this crate: the per-peer in-flight window, the deferred loss queue and the
//!  handoff queues between the I/O thread and the simulation thread.
//!
//! Slots are `Option<T>` so that popping or clearing a slot drops whatever the slot owned -
//!  records in here own packet payloads, and a slot that is logically empty must not keep a
//!  payload alive.

use std::fmt::{Debug, Formatter};
use std::ops::Index;
use anyhow::bail;

/// number of slots allocated up front, see [RingBuffer::new]
const INITIAL_SLOTS: usize = 16;

/// What `push` does when the buffer is at capacity
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// evict the oldest entry to make room
    Overwrite,
    /// refuse the new entry, handing it back to the caller
    Reject,
}

pub struct RingBuffer<T> {
    /// grows (doubling) up to `capacity`, and never shrinks
    slots: Vec<Option<T>>,
    capacity: usize,
    /// index of the slot the next pushed entry goes to
    head: usize,
    /// index of the oldest entry
    tail: usize,
    count: usize,
    /// incremented on every structural modification, see [Cursor]
    version: u64,
    overflow: OverflowPolicy,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding up to `capacity` entries. Only a small number of slots is
    ///  allocated initially, so a generous capacity costs nothing until it is used.
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> RingBuffer<T> {
        assert!(capacity > 0, "a ring buffer needs a capacity of at least 1");

        RingBuffer {
            slots: (0..capacity.min(INITIAL_SLOTS)).map(|_| None).collect(),
            capacity,
            head: 0,
            tail: 0,
            count: 0,
            version: 0,
            overflow,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Appends an entry at the 'newest' end.
    ///
    /// If the buffer is full, the outcome depends on the overflow policy: with `Overwrite`, the
    ///  oldest entry is evicted and returned as `Ok(Some(evicted))`; with `Reject`, the buffer is
    ///  left untouched and the new entry is returned as `Err(item)`.
    pub fn push(&mut self, item: T) -> Result<Option<T>, T> {
        let evicted = if self.is_full() {
            match self.overflow {
                OverflowPolicy::Overwrite => self.try_pop(),
                OverflowPolicy::Reject => return Err(item),
            }
        }
        else {
            None
        };

        if self.count == self.slots.len() {
            self.grow();
        }

        self.version = self.version.wrapping_add(1);
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % self.slots.len();
        self.count += 1;

        Ok(evicted)
    }

    /// Removes and returns the oldest entry.
    ///
    /// Panics if the buffer is empty: callers are expected to check, and popping from an empty
    ///  buffer points to a bug in the calling code.
    pub fn pop(&mut self) -> T {
        match self.try_pop() {
            Some(item) => item,
            None => panic!("pop() called on an empty ring buffer"),
        }
    }

    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        self.version = self.version.wrapping_add(1);
        let item = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % self.slots.len();
        self.count -= 1;

        debug_assert!(item.is_some(), "occupied slot was empty");
        item
    }

    /// the oldest entry, if any
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Entry at logical position `index`, 0 being the oldest
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count {
            return None;
        }
        self.slots[self.physical_index(index)].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.count {
            return None;
        }
        let physical = self.physical_index(index);
        self.slots[physical].as_mut()
    }

    /// Drops all entries and resets the buffer to its initial position. Every slot is
    ///  overwritten, not just the occupied ones.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
        self.version = self.version.wrapping_add(1);

        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Removes all entries oldest-first
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.try_pop())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }

    /// A detached iteration position. Unlike [RingBuffer::iter], a cursor does not borrow the
    ///  buffer between steps, so the buffer can be modified while a cursor exists - the cursor
    ///  detects this and fails on its next step.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            version: self.version,
            index: 0,
            count: self.count,
        }
    }

    /// Called when all allocated slots are occupied but the capacity is not reached yet: moves the
    ///  entries to the start of the slot vector in logical order and extends it.
    fn grow(&mut self) {
        self.slots.rotate_left(self.tail);
        let new_len = (self.slots.len() * 2).min(self.capacity);
        self.slots.resize_with(new_len, || None);
        self.tail = 0;
        self.head = self.count;
    }

    fn physical_index(&self, logical: usize) -> usize {
        (self.tail + logical) % self.slots.len()
    }
}

impl<T> Index<usize> for RingBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(item) => item,
            None => panic!("index {} out of range for ring buffer with {} entries", index, self.count),
        }
    }
}

impl<T: Debug> Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter())
            .finish()
    }
}

/// Iteration position over a snapshot of a [RingBuffer]'s entries at the time the cursor was
///  created.
#[derive(Clone, Debug)]
pub struct Cursor {
    version: u64,
    index: usize,
    count: usize,
}

impl Cursor {
    /// Returns the next entry, `Ok(None)` after the last one, or an error if the buffer was
    ///  structurally modified since the cursor was created.
    pub fn next<'a, T>(&mut self, buffer: &'a RingBuffer<T>) -> anyhow::Result<Option<&'a T>> {
        if buffer.version != self.version {
            bail!("ring buffer was modified during iteration");
        }

        if self.index >= self.count {
            return Ok(None);
        }

        let item = &buffer[self.index];
        self.index += 1;
        Ok(Some(item))
    }
}
