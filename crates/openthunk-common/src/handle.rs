//! Opaque handles for host objects referenced from the guest
//!
//! The guest never sees a host pointer to a wrapper object; it gets a small
//! integer that the host side resolves through a [`HandleTable`]. Handle 0 is
//! never issued so it can stand for "none" in an envelope slot.
//!
//! The low 24 bits of a handle select a slot, the high 8 bits carry the
//! slot's generation. Freed slots are reused oldest first and a reused slot
//! issues a new generation, so a stale handle does not resolve to the object
//! that took its place.

use std::collections::VecDeque;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const MAX_SLOTS: usize = INDEX_MASK as usize;

#[derive(Debug)]
struct Slot<T> {
    generation: u8,
    value: Option<T>,
}

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn compose(index: u32, generation: u8) -> u32 {
    (u32::from(generation) << INDEX_BITS) | (index + 1)
}

impl<T> HandleTable<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
        }
    }

    /// `None` once every slot is live.
    pub fn insert(&mut self, value: T) -> Option<u32> {
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Some(compose(index, slot.generation));
        }
        if self.slots.len() >= MAX_SLOTS {
            return None;
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Some(compose(index, 0))
    }

    fn slot(&self, handle: u32) -> Option<&Slot<T>> {
        let index = (handle & INDEX_MASK).checked_sub(1)? as usize;
        let slot = self.slots.get(index)?;
        (u32::from(slot.generation) == handle >> INDEX_BITS).then_some(slot)
    }

    pub fn get(&self, handle: u32) -> Option<&T> {
        self.slot(handle)?.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut T> {
        self.slot(handle)?;
        let index = (handle & INDEX_MASK) as usize - 1;
        self.slots[index].value.as_mut()
    }

    pub fn remove(&mut self, handle: u32) -> Option<T> {
        self.slot(handle)?;
        let index = (handle & INDEX_MASK) - 1;
        let slot = &mut self.slots[index as usize];
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_start_at_one_and_slots_are_reused() {
        let mut table = HandleTable::new();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.get(a), None);
        let c = table.insert("c").unwrap();
        assert_eq!(c & INDEX_MASK, a);
        assert_eq!(table.get(c), Some(&"c"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_stale_handle_does_not_reach_new_object() {
        let mut table = HandleTable::new();
        let old = table.insert(1).unwrap();
        table.remove(old);
        let new = table.insert(2).unwrap();
        assert_ne!(old, new);
        assert_eq!(table.get(old), None);
        assert_eq!(table.get_mut(old), None);
        assert_eq!(table.remove(old), None);
        assert_eq!(table.get(new), Some(&2));
    }

    #[test]
    fn test_freed_slots_are_reused_oldest_first() {
        let mut table = HandleTable::new();
        let handles: Vec<u32> = (0..3).map(|i| table.insert(i).unwrap()).collect();
        table.remove(handles[0]);
        table.remove(handles[2]);
        table.remove(handles[1]);
        let reused: Vec<u32> = (0..3)
            .map(|i| table.insert(i).unwrap() & INDEX_MASK)
            .collect();
        assert_eq!(reused, [handles[0], handles[2], handles[1]]);
    }

    #[test]
    fn test_zero_and_unknown_handles_resolve_to_none() {
        let mut table: HandleTable<u8> = HandleTable::new();
        assert!(table.get(0).is_none());
        assert!(table.remove(0).is_none());
        assert!(table.get(42).is_none());
        let h = table.insert(7).unwrap();
        assert!(table.get(h | (5 << INDEX_BITS)).is_none());
        assert!(table.remove(0).is_none());
        assert_eq!(table.len(), 1);
    }
}
