//! The live-allocation registry: slot -> block address, for leak reports.
//!
//! Slots are handed out from an explicit free stack, so inserting is O(1)
//! until the table is full. A full table grows by a fixed increment. The
//! table never shrinks, which keeps a slot index stable for as long as its
//! block is alive.

use std::ptr::NonNull;

use log::debug;

use super::header::Slot;
use crate::util::hint::cold;

pub struct Registry {
    /// `0` is an empty slot, anything else is the address of a raw block
    slots: Vec<usize>,
    /// Empty slots, lowest index on top
    free: Vec<Slot>,
    used: usize,
    increment: usize,
}

impl Registry {
    /// A registry with `initial` empty slots, growing `increment` slots at a
    /// time. Both are clamped to at least one.
    pub fn new(initial: usize, increment: usize) -> Self {
        let mut registry = Self {
            slots: Vec::new(),
            free: Vec::new(),
            used: 0,
            increment: increment.max(1),
        };
        registry.grow_by(initial.max(1));
        registry
    }

    fn grow_by(&mut self, additional: usize) {
        let start = self.slots.len();
        self.slots.resize(start + additional, 0);
        // pushed in reverse so that the lowest new index is popped first
        self.free.extend((start..start + additional).rev());
    }

    /// Record `block` and return the slot it now lives in.
    pub fn insert(&mut self, block: NonNull<u8>) -> Slot {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => cold(|| {
                debug!(
                    "registry full at {} slots, growing by {}",
                    self.capacity(),
                    self.increment
                );
                self.grow_by(self.increment);
                self.free.pop().expect("just grew the registry")
            }),
        };
        debug_assert_eq!(self.slots[slot], 0);
        self.slots[slot] = block.as_ptr() as usize;
        self.used += 1;
        slot
    }

    /// Does `slot` hold exactly `block`?
    pub fn holds(&self, slot: Slot, block: NonNull<u8>) -> bool {
        self.slots.get(slot).copied() == Some(block.as_ptr() as usize)
    }

    /// Clear `slot`, returning the address it held. Nothing happens to an
    /// out-of-range or already empty slot.
    pub fn remove(&mut self, slot: Slot) -> Option<usize> {
        let entry = self.slots.get_mut(slot)?;
        if *entry == 0 {
            return None;
        }
        let address = std::mem::replace(entry, 0);
        self.free.push(slot);
        self.used -= 1;
        Some(address)
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Every occupied slot, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, NonNull<u8>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, &address)| Some((slot, NonNull::new(address as *mut u8)?)))
    }
}
