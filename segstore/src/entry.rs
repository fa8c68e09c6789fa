use bytemuck::{Pod, Zeroable};
use modular_bitfield::prelude::B30;
use modular_bitfield::{Specifier, bitfield};

#[derive(Specifier, PartialEq, Eq, Debug, Clone, Copy)]
#[bits = 2]
pub enum SlotStatus {
    /// Never handed out since the segment was last reset
    Empty,
    Full,
    /// On the free list
    Free,
}

/// One entry slot of a segment.
///
/// The record (key bytes followed by value bytes) lives in the segment heap at
/// `heap_pos`. A free slot reuses `next_free` as the free-list link
/// (slot index + 1, `0` ends the list).
#[bitfield(bits = 160)]
#[derive(Clone, Copy, Zeroable, Pod, Debug)]
#[repr(C)]
pub struct EntrySlot {
    pub status: SlotStatus,
    pub next_free: B30,
    pub hash_tag: u32,
    pub heap_pos: u32,
    pub key_len: u32,
    pub value_len: u32,
}

pub const ENTRY_SIZE: usize = std::mem::size_of::<EntrySlot>();

impl EntrySlot {
    pub fn occupied(hash_tag: u32, heap_pos: u32, key_len: u32, value_len: u32) -> Self {
        EntrySlot::new()
            .with_status(SlotStatus::Full)
            .with_hash_tag(hash_tag)
            .with_heap_pos(heap_pos)
            .with_key_len(key_len)
            .with_value_len(value_len)
    }

    pub fn free(next_free: u32) -> Self {
        EntrySlot::new()
            .with_status(SlotStatus::Free)
            .with_next_free(next_free)
    }

    pub fn is_occupied(&self) -> bool {
        self.status() == SlotStatus::Full
    }

    pub fn is_free(&self) -> bool {
        self.status() == SlotStatus::Free
    }

    pub fn record_len(&self) -> usize {
        self.key_len() as usize + self.value_len() as usize
    }

    pub fn key_range(&self) -> std::ops::Range<usize> {
        let start = self.heap_pos() as usize;
        start..start + self.key_len() as usize
    }

    pub fn value_range(&self) -> std::ops::Range<usize> {
        let start = self.key_range().end;
        start..start + self.value_len() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_twenty_bytes() {
        assert_eq!(ENTRY_SIZE, 20);
        assert_eq!(std::mem::align_of::<EntrySlot>(), 1);
    }

    #[test]
    fn test_zeroed_slot_is_empty() {
        let slot: EntrySlot = Zeroable::zeroed();
        assert_eq!(slot.status(), SlotStatus::Empty);
        assert!(!slot.is_occupied());
        assert!(!slot.is_free());
    }

    #[test]
    fn test_occupied_slot_ranges() {
        let slot = EntrySlot::occupied(0xabcd_0123, 100, 8, 24);
        assert!(slot.is_occupied());
        assert_eq!(slot.hash_tag(), 0xabcd_0123);
        assert_eq!(slot.key_range(), 100..108);
        assert_eq!(slot.value_range(), 108..132);
        assert_eq!(slot.record_len(), 32);
    }

    #[test]
    fn test_free_slot_links() {
        let slot = EntrySlot::free((1 << 30) - 1);
        assert!(slot.is_free());
        assert_eq!(slot.next_free(), (1 << 30) - 1);
        assert_eq!(slot.record_len(), 0);
    }
}
