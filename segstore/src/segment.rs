//! Layout and index operations of one segment region.
//!
//! ```text
//! +----------------+------------------+--------------------+-------------+
//! | SegmentHeader  | bucket table     | entry slots        | record heap |
//! | 64 bytes       | buckets x u32    | slots x EntrySlot  | heap_bytes  |
//! +----------------+------------------+--------------------+-------------+
//! ```
//!
//! A zero-filled region is a valid empty segment. Nothing here locks: callers
//! hold the segment's lock while a [`SegmentRef`] or [`SegmentMut`] is alive.

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::entry::{ENTRY_SIZE, EntrySlot, SlotStatus};
use crate::error::{HashError, Result};

pub const SEGMENT_HEADER_SIZE: usize = 64;

/// Free-list links are 30-bit slot numbers offset by one.
pub const MAX_SLOTS: usize = (1 << 30) - 2;

const EMPTY: u32 = 0;
const TOMBSTONE: u32 = u32::MAX;

/// Upper half of the key hash. The lower half already picked the segment.
pub fn hash_tag(hash: u64) -> u32 {
    (hash >> 32) as u32
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct SegmentHeader {
    pub entries: u64,
    /// Slots ever handed out since the last reset
    pub slots_used: u64,
    /// Slot index + 1 of the first free slot, `0` when the list is empty
    pub free_head: u64,
    pub heap_used: u64,
    /// Heap bytes held by removed or shrunk records
    pub garbage: u64,
    pub tombstones: u64,
    reserved: [u64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    slots: usize,
    buckets: usize,
    heap_bytes: usize,
}

impl SegmentGeometry {
    pub fn new(slots: usize, heap_bytes: usize) -> Result<Self> {
        if slots == 0 || slots > MAX_SLOTS {
            return Err(HashError::InvalidConfig(format!(
                "entries per segment must be in 1..={MAX_SLOTS}, got {slots}"
            )));
        }
        if heap_bytes > u32::MAX as usize {
            return Err(HashError::InvalidConfig(format!(
                "segment heap of {heap_bytes} bytes exceeds {} bytes",
                u32::MAX
            )));
        }
        Ok(Self {
            slots,
            buckets: (slots * 2).next_power_of_two(),
            heap_bytes,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }

    fn slots_offset(&self) -> usize {
        SEGMENT_HEADER_SIZE + align_up(self.buckets * 4, 8)
    }

    fn heap_offset(&self) -> usize {
        self.slots_offset() + align_up(self.slots * ENTRY_SIZE, 8)
    }

    /// Bytes one segment occupies, a multiple of 64.
    pub fn region_size(&self) -> usize {
        align_up(self.heap_offset() + self.heap_bytes, 64)
    }
}

/// Where a key lives: its bucket in the table and its entry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub bucket: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub entries: usize,
    pub capacity: usize,
    pub heap_used: usize,
    pub heap_capacity: usize,
    pub garbage_bytes: usize,
    pub tombstones: usize,
}

/// Read access to a segment region.
#[derive(Clone, Copy)]
pub struct SegmentRef<'a> {
    header: &'a SegmentHeader,
    buckets: &'a [u32],
    slots: &'a [EntrySlot],
    heap: &'a [u8],
}

impl<'a> SegmentRef<'a> {
    /// `region` must be 8-byte aligned and at least `geometry.region_size()` long.
    pub fn new(region: &'a [u8], geometry: &SegmentGeometry) -> Self {
        let (header, rest) = region.split_at(SEGMENT_HEADER_SIZE);
        let (buckets, rest) = rest.split_at(geometry.slots_offset() - SEGMENT_HEADER_SIZE);
        let (slots, rest) = rest.split_at(geometry.heap_offset() - geometry.slots_offset());
        Self {
            header: bytemuck::from_bytes(header),
            buckets: bytemuck::cast_slice(&buckets[..geometry.buckets * 4]),
            slots: bytemuck::cast_slice(&slots[..geometry.slots * ENTRY_SIZE]),
            heap: &rest[..geometry.heap_bytes],
        }
    }

    pub fn header(&self) -> &'a SegmentHeader {
        self.header
    }

    pub fn len(&self) -> usize {
        self.header.entries as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.entries == 0
    }

    pub fn slot(&self, slot: usize) -> EntrySlot {
        self.slots[slot]
    }

    pub fn key(&self, slot: usize) -> &'a [u8] {
        let heap: &'a [u8] = self.heap;
        &heap[self.slots[slot].key_range()]
    }

    pub fn value(&self, slot: usize) -> &'a [u8] {
        let heap: &'a [u8] = self.heap;
        &heap[self.slots[slot].value_range()]
    }

    pub fn lookup(&self, hash: u64, key: &[u8]) -> Option<Found> {
        let tag = hash_tag(hash);
        let mask = self.buckets.len() - 1;
        let mut bucket = tag as usize & mask;
        for _ in 0..self.buckets.len() {
            match self.buckets[bucket] {
                EMPTY => return None,
                TOMBSTONE => {}
                link => {
                    let slot = (link - 1) as usize;
                    if self.slots[slot].hash_tag() == tag && self.key(slot) == key {
                        return Some(Found { bucket, slot });
                    }
                }
            }
            bucket = (bucket + 1) & mask;
        }
        None
    }

    /// The bucket pointing at `slot`, found by probing from its tag.
    pub fn bucket_of(&self, slot: usize) -> Option<usize> {
        let entry = self.slots.get(slot).filter(|e| e.is_occupied())?;
        let mask = self.buckets.len() - 1;
        let mut bucket = entry.hash_tag() as usize & mask;
        for _ in 0..self.buckets.len() {
            match self.buckets[bucket] {
                EMPTY => return None,
                link if link != TOMBSTONE && (link - 1) as usize == slot => return Some(bucket),
                _ => {}
            }
            bucket = (bucket + 1) & mask;
        }
        None
    }

    /// Occupied slot indexes in slot order.
    pub fn live_slots(self) -> impl Iterator<Item = usize> + 'a {
        let used = self.header.slots_used as usize;
        self.slots[..used]
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_occupied())
            .map(|(slot, _)| slot)
    }

    /// `(slot, key, value)` of every live entry.
    pub fn entries(self) -> impl Iterator<Item = (usize, &'a [u8], &'a [u8])> + 'a {
        self.live_slots()
            .map(move |slot| (slot, self.key(slot), self.value(slot)))
    }

    pub fn heap_free(&self) -> usize {
        self.heap.len() - self.header.heap_used as usize
    }

    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            entries: self.len(),
            capacity: self.slots.len(),
            heap_used: self.header.heap_used as usize,
            heap_capacity: self.heap.len(),
            garbage_bytes: self.header.garbage as usize,
            tombstones: self.header.tombstones as usize,
        }
    }

    /// Bounds check of a region read back from a file: the header, every
    /// handed-out slot and every bucket link.
    pub fn validate(&self) -> Result<()> {
        let h = self.header;
        let sane = h.slots_used as usize <= self.slots.len()
            && h.entries <= h.slots_used
            && h.free_head <= h.slots_used
            && h.heap_used as usize <= self.heap.len()
            && h.garbage <= h.heap_used
            && h.tombstones as usize <= self.buckets.len();
        if !sane {
            return Err(HashError::Corrupt(format!(
                "segment header out of bounds: {h:?}"
            )));
        }

        let mut occupied = 0;
        for (slot, entry) in self.slots[..h.slots_used as usize].iter().enumerate() {
            let status = entry
                .status_or_err()
                .map_err(|_| HashError::Corrupt(format!("slot {slot} has an invalid status")))?;
            match status {
                SlotStatus::Full => {
                    let end = entry.heap_pos() as u64 + entry.record_len() as u64;
                    if end > h.heap_used {
                        return Err(HashError::Corrupt(format!(
                            "slot {slot} record ends at {end}, heap holds {}",
                            h.heap_used
                        )));
                    }
                    occupied += 1;
                }
                SlotStatus::Free if entry.next_free() as u64 <= h.slots_used => {}
                _ => {
                    return Err(HashError::Corrupt(format!(
                        "slot {slot} is {status:?} inside the used range"
                    )));
                }
            }
        }
        if occupied != h.entries {
            return Err(HashError::Corrupt(format!(
                "{occupied} occupied slots, header counts {}",
                h.entries
            )));
        }

        for (bucket, &link) in self.buckets.iter().enumerate() {
            let points_at_live = |link: u32| {
                (link as u64) <= h.slots_used && self.slots[(link - 1) as usize].is_occupied()
            };
            if link != EMPTY && link != TOMBSTONE && !points_at_live(link) {
                return Err(HashError::Corrupt(format!(
                    "bucket {bucket} links to slot {link} of {} in use",
                    h.slots_used
                )));
            }
        }
        Ok(())
    }
}

/// Write access to a segment region.
pub struct SegmentMut<'a> {
    header: &'a mut SegmentHeader,
    buckets: &'a mut [u32],
    slots: &'a mut [EntrySlot],
    heap: &'a mut [u8],
}

impl<'a> SegmentMut<'a> {
    /// `region` must be 8-byte aligned and at least `geometry.region_size()` long.
    pub fn new(region: &'a mut [u8], geometry: &SegmentGeometry) -> Self {
        let (header, rest) = region.split_at_mut(SEGMENT_HEADER_SIZE);
        let (buckets, rest) = rest.split_at_mut(geometry.slots_offset() - SEGMENT_HEADER_SIZE);
        let (slots, rest) = rest.split_at_mut(geometry.heap_offset() - geometry.slots_offset());
        Self {
            header: bytemuck::from_bytes_mut(header),
            buckets: bytemuck::cast_slice_mut(&mut buckets[..geometry.buckets * 4]),
            slots: bytemuck::cast_slice_mut(&mut slots[..geometry.slots * ENTRY_SIZE]),
            heap: &mut rest[..geometry.heap_bytes],
        }
    }

    pub fn reader(&self) -> SegmentRef<'_> {
        SegmentRef {
            header: &*self.header,
            buckets: &*self.buckets,
            slots: &*self.slots,
            heap: &*self.heap,
        }
    }

    pub fn len(&self) -> usize {
        self.header.entries as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.entries == 0
    }

    /// Store a new entry. The key must not be present.
    ///
    /// On error the segment is left as it was, apart from a possible compaction.
    pub fn insert(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<Found> {
        let record = key.len() + value.len();
        if record > self.heap.len() {
            return Err(HashError::EntryTooLarge {
                size: record,
                capacity: self.heap.len(),
            });
        }
        if self.len() >= self.slots.len() {
            return Err(HashError::SegmentFull {
                capacity: self.slots.len(),
            });
        }
        self.reserve_heap(record)?;
        if self.header.tombstones as usize * 4 > self.buckets.len() {
            self.rebuild_index();
        }

        let tag = hash_tag(hash);
        let bucket = self.vacant_bucket(tag)?;
        let slot = self.alloc_slot();
        let pos = self.alloc_heap(record);
        self.heap[pos..pos + key.len()].copy_from_slice(key);
        self.heap[pos + key.len()..pos + record].copy_from_slice(value);
        self.slots[slot] = EntrySlot::occupied(tag, pos as u32, key.len() as u32, value.len() as u32);

        if self.buckets[bucket] == TOMBSTONE {
            self.header.tombstones -= 1;
        }
        self.buckets[bucket] = slot as u32 + 1;
        self.header.entries += 1;
        Ok(Found { bucket, slot })
    }

    /// Overwrite the value of a live slot. Values that do not grow are
    /// written in place; larger ones move the record to fresh heap space.
    pub fn replace_value(&mut self, slot: usize, value: &[u8]) -> Result<()> {
        let entry = self.slots[slot];
        let old_len = entry.value_len() as usize;
        if value.len() <= old_len {
            let start = entry.value_range().start;
            self.heap[start..start + value.len()].copy_from_slice(value);
            self.header.garbage += (old_len - value.len()) as u64;
            self.slots[slot] = entry.with_value_len(value.len() as u32);
            return Ok(());
        }

        let key_len = entry.key_len() as usize;
        let record = key_len + value.len();
        if record > self.heap.len() {
            return Err(HashError::EntryTooLarge {
                size: record,
                capacity: self.heap.len(),
            });
        }
        if self.reader().heap_free() < record {
            return self.relocate_compacted(slot, value);
        }

        let old_key = entry.key_range();
        let pos = self.alloc_heap(record);
        self.heap.copy_within(old_key, pos);
        self.heap[pos + key_len..pos + record].copy_from_slice(value);
        self.header.garbage += entry.record_len() as u64;
        self.slots[slot] = entry
            .with_heap_pos(pos as u32)
            .with_value_len(value.len() as u32);
        Ok(())
    }

    /// Grow the value of `slot` when the heap tail is too short, counting the
    /// slot's own record as reclaimable. Leaves the segment untouched on error.
    fn relocate_compacted(&mut self, slot: usize, value: &[u8]) -> Result<()> {
        let entry = self.slots[slot];
        let key_len = entry.key_len() as usize;
        let record = key_len + value.len();
        let available =
            self.reader().heap_free() + self.header.garbage as usize + entry.record_len();
        if available < record {
            return Err(HashError::HeapExhausted {
                needed: record,
                available,
            });
        }

        let key = self.heap[entry.key_range()].to_vec();
        self.header.garbage += entry.record_len() as u64;
        // an empty record is skipped over by compaction
        self.slots[slot] = entry.with_key_len(0).with_value_len(0);
        self.compact();

        let pos = self.alloc_heap(record);
        self.heap[pos..pos + key_len].copy_from_slice(&key);
        self.heap[pos + key_len..pos + record].copy_from_slice(value);
        self.slots[slot] = entry
            .with_heap_pos(pos as u32)
            .with_value_len(value.len() as u32);
        Ok(())
    }

    pub fn remove(&mut self, found: Found) {
        let entry = self.slots[found.slot];
        self.buckets[found.bucket] = TOMBSTONE;
        self.header.tombstones += 1;
        self.header.garbage += entry.record_len() as u64;
        self.slots[found.slot] = EntrySlot::free(self.header.free_head as u32);
        self.header.free_head = found.slot as u64 + 1;
        self.header.entries -= 1;
        if self.header.entries == 0 {
            self.reset();
        }
    }

    /// Remove the live entry in `slot`; `false` if the slot is not live.
    pub fn remove_slot(&mut self, slot: usize) -> bool {
        let bucket = self.reader().bucket_of(slot);
        match bucket {
            Some(bucket) => {
                self.remove(Found { bucket, slot });
                true
            }
            None => false,
        }
    }

    /// Empty the segment.
    pub fn reset(&mut self) {
        *self.header = SegmentHeader::default();
        self.buckets.fill(EMPTY);
    }

    /// Slide live records to the front of the heap. Returns reclaimed bytes.
    pub fn compact(&mut self) -> usize {
        let mut live: Vec<usize> = self.reader().live_slots().collect();
        live.sort_unstable_by_key(|&slot| self.slots[slot].heap_pos());

        let mut cursor = 0;
        for slot in live {
            let entry = self.slots[slot];
            let start = entry.heap_pos() as usize;
            let len = entry.record_len();
            if start != cursor {
                self.heap.copy_within(start..start + len, cursor);
                self.slots[slot] = entry.with_heap_pos(cursor as u32);
            }
            cursor += len;
        }

        let reclaimed = self.header.heap_used as usize - cursor;
        self.header.heap_used = cursor as u64;
        self.header.garbage = 0;
        debug!(reclaimed, heap_used = cursor, "compacted segment heap");
        reclaimed
    }

    /// Rebuild the bucket table from the slots, dropping every tombstone.
    pub fn rebuild_index(&mut self) {
        let dropped = self.header.tombstones;
        self.buckets.fill(EMPTY);
        let mask = self.buckets.len() - 1;
        for slot in 0..self.header.slots_used as usize {
            let entry = self.slots[slot];
            if !entry.is_occupied() {
                continue;
            }
            let mut bucket = entry.hash_tag() as usize & mask;
            while self.buckets[bucket] != EMPTY {
                bucket = (bucket + 1) & mask;
            }
            self.buckets[bucket] = slot as u32 + 1;
        }
        self.header.tombstones = 0;
        debug!(dropped, "rebuilt segment bucket table");
    }

    fn reserve_heap(&mut self, needed: usize) -> Result<()> {
        if self.reader().heap_free() < needed && self.header.garbage > 0 {
            self.compact();
        }
        let available = self.reader().heap_free();
        if available < needed {
            return Err(HashError::HeapExhausted { needed, available });
        }
        Ok(())
    }

    fn vacant_bucket(&self, tag: u32) -> Result<usize> {
        let mask = self.buckets.len() - 1;
        let mut bucket = tag as usize & mask;
        for _ in 0..self.buckets.len() {
            if matches!(self.buckets[bucket], EMPTY | TOMBSTONE) {
                return Ok(bucket);
            }
            bucket = (bucket + 1) & mask;
        }
        Err(HashError::Corrupt("bucket table has no vacant bucket".to_string()))
    }

    fn alloc_slot(&mut self) -> usize {
        match self.header.free_head {
            0 => {
                let slot = self.header.slots_used as usize;
                self.header.slots_used += 1;
                slot
            }
            head => {
                let slot = head as usize - 1;
                self.header.free_head = self.slots[slot].next_free() as u64;
                slot
            }
        }
    }

    fn alloc_heap(&mut self, len: usize) -> usize {
        let pos = self.header.heap_used as usize;
        self.header.heap_used += len as u64;
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rustc_hash::FxBuildHasher;
    use std::collections::HashMap;
    use std::hash::BuildHasher;

    struct TestSegment {
        geometry: SegmentGeometry,
        backing: Vec<u64>,
    }

    impl TestSegment {
        fn new(slots: usize, heap_bytes: usize) -> Self {
            let geometry = SegmentGeometry::new(slots, heap_bytes).unwrap();
            let backing = vec![0u64; geometry.region_size() / 8];
            Self { geometry, backing }
        }

        fn view(&mut self) -> SegmentMut<'_> {
            SegmentMut::new(bytemuck::cast_slice_mut(&mut self.backing), &self.geometry)
        }
    }

    fn hash(key: &[u8]) -> u64 {
        FxBuildHasher.hash_one(key)
    }

    fn insert(segment: &mut SegmentMut<'_>, key: &[u8], value: &[u8]) -> Result<Found> {
        segment.insert(hash(key), key, value)
    }

    fn get<'a>(segment: &'a SegmentMut<'_>, key: &[u8]) -> Option<&'a [u8]> {
        let view = segment.reader();
        view.lookup(hash(key), key).map(|found| view.value(found.slot))
    }

    #[test]
    fn test_geometry_layout() -> Result<()> {
        let geometry = SegmentGeometry::new(100, 4000)?;
        assert_eq!(geometry.buckets(), 256);
        assert_eq!(geometry.region_size() % 64, 0);
        assert!(geometry.region_size() >= 64 + 256 * 4 + 100 * ENTRY_SIZE + 4000);

        assert!(SegmentGeometry::new(0, 10).is_err());
        assert!(SegmentGeometry::new(MAX_SLOTS + 1, 10).is_err());
        assert!(SegmentGeometry::new(1, u32::MAX as usize + 1).is_err());
        Ok(())
    }

    #[test]
    fn test_zeroed_segment_is_empty() {
        let mut segment = TestSegment::new(16, 256);
        let view = segment.view();
        assert!(view.is_empty());
        assert_eq!(view.reader().live_slots().count(), 0);
        assert!(view.reader().validate().is_ok());
        assert_eq!(get(&view, b"missing"), None);
    }

    #[test]
    fn test_insert_lookup_remove() -> Result<()> {
        let mut segment = TestSegment::new(16, 512);
        let mut view = segment.view();

        let found = insert(&mut view, b"alpha", b"one")?;
        insert(&mut view, b"beta", b"two")?;
        assert_eq!(view.len(), 2);
        assert_eq!(get(&view, b"alpha"), Some(&b"one"[..]));
        assert_eq!(get(&view, b"beta"), Some(&b"two"[..]));
        assert_eq!(view.reader().key(found.slot), b"alpha");

        let found = view.reader().lookup(hash(b"alpha"), b"alpha").unwrap();
        view.remove(found);
        assert_eq!(get(&view, b"alpha"), None);
        assert_eq!(get(&view, b"beta"), Some(&b"two"[..]));
        assert_eq!(view.len(), 1);
        Ok(())
    }

    #[test]
    fn test_colliding_hashes_resolved_by_key_bytes() -> Result<()> {
        let mut segment = TestSegment::new(8, 256);
        let mut view = segment.view();
        let same = 0x1234_5678_0000_0001;

        view.insert(same, b"first", b"1")?;
        view.insert(same, b"second", b"2")?;

        let a = view.reader().lookup(same, b"first").unwrap();
        let b = view.reader().lookup(same, b"second").unwrap();
        assert_ne!(a.slot, b.slot);
        assert_eq!(view.reader().value(b.slot), b"2");
        assert_eq!(view.reader().lookup(same, b"third"), None);

        // removing the first of the chain keeps the second reachable
        view.remove(a);
        assert_eq!(view.reader().lookup(same, b"second"), Some(b));
        Ok(())
    }

    #[test]
    fn test_free_slot_is_reused() -> Result<()> {
        let mut segment = TestSegment::new(8, 256);
        let mut view = segment.view();

        let a = insert(&mut view, b"a", b"1")?;
        insert(&mut view, b"b", b"2")?;
        view.remove(a);

        let c = insert(&mut view, b"c", b"3")?;
        assert_eq!(c.slot, a.slot);
        assert_eq!(view.reader().header().slots_used, 2);
        Ok(())
    }

    #[test]
    fn test_segment_full() -> Result<()> {
        let mut segment = TestSegment::new(4, 256);
        let mut view = segment.view();
        for i in 0..4u8 {
            insert(&mut view, &[i], b"v")?;
        }
        let err = insert(&mut view, &[9], b"v").unwrap_err();
        assert!(matches!(err, HashError::SegmentFull { capacity: 4 }));
        assert_eq!(view.len(), 4);
        Ok(())
    }

    #[test]
    fn test_entry_too_large() {
        let mut segment = TestSegment::new(4, 32);
        let mut view = segment.view();
        let err = insert(&mut view, b"key", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, HashError::EntryTooLarge { size: 67, capacity: 32 }));
        assert!(view.is_empty());
    }

    #[test]
    fn test_heap_compacts_when_short() -> Result<()> {
        let mut segment = TestSegment::new(8, 64);
        let mut view = segment.view();
        for key in [b"k0", b"k1", b"k2", b"k3"] {
            insert(&mut view, key, &[7u8; 14])?;
        }
        assert_eq!(view.reader().heap_free(), 0);

        for key in [b"k1", b"k2"] {
            let slot = view.reader().lookup(hash(key), key).unwrap().slot;
            assert!(view.remove_slot(slot));
        }
        assert!(!view.remove_slot(1));
        assert_eq!(view.reader().header().garbage, 32);

        insert(&mut view, b"k4", &[9u8; 14])?;
        let stats = view.reader().stats();
        assert_eq!(stats.garbage_bytes, 0);
        assert_eq!(stats.heap_used, 48);
        assert_eq!(get(&view, b"k0"), Some(&[7u8; 14][..]));
        assert_eq!(get(&view, b"k3"), Some(&[7u8; 14][..]));
        assert_eq!(get(&view, b"k4"), Some(&[9u8; 14][..]));

        let err = insert(&mut view, b"k5", &[1u8; 30]).unwrap_err();
        assert!(matches!(err, HashError::HeapExhausted { needed: 32, available: 16 }));
        Ok(())
    }

    #[test]
    fn test_replace_value_in_place_and_relocated() -> Result<()> {
        let mut segment = TestSegment::new(8, 128);
        let mut view = segment.view();
        let found = insert(&mut view, b"key", b"medium")?;
        let pos = view.reader().slot(found.slot).heap_pos();

        view.replace_value(found.slot, b"tiny")?;
        assert_eq!(get(&view, b"key"), Some(&b"tiny"[..]));
        assert_eq!(view.reader().slot(found.slot).heap_pos(), pos);
        assert_eq!(view.reader().header().garbage, 2);

        view.replace_value(found.slot, b"a much longer value")?;
        assert_eq!(get(&view, b"key"), Some(&b"a much longer value"[..]));
        assert_ne!(view.reader().slot(found.slot).heap_pos(), pos);
        assert_eq!(view.reader().key(found.slot), b"key");
        Ok(())
    }

    #[test]
    fn test_growing_value_reuses_its_own_record() -> Result<()> {
        let mut segment = TestSegment::new(4, 64);
        let mut view = segment.view();
        let found = insert(&mut view, b"k", &[1u8; 31])?;
        assert_eq!(view.reader().heap_free(), 32);

        view.replace_value(found.slot, &[2u8; 50])?;
        assert_eq!(get(&view, b"k"), Some(&[2u8; 50][..]));
        assert_eq!(view.reader().key(found.slot), b"k");
        let stats = view.reader().stats();
        assert_eq!(stats.heap_used, 51);
        assert_eq!(stats.garbage_bytes, 0);
        assert!(view.reader().validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_growing_value_that_cannot_fit_changes_nothing() -> Result<()> {
        let mut segment = TestSegment::new(4, 64);
        let mut view = segment.view();
        let other = insert(&mut view, b"a", &[1u8; 19])?;
        let found = insert(&mut view, b"b", &[2u8; 19])?;
        view.replace_value(other.slot, &[3u8; 9])?;
        let before = *view.reader().header();

        let err = view.replace_value(found.slot, &[4u8; 60]).unwrap_err();
        assert!(matches!(err, HashError::HeapExhausted { needed: 61, available: 54 }));
        assert_eq!(*view.reader().header(), before);
        assert_eq!(get(&view, b"a"), Some(&[3u8; 9][..]));
        assert_eq!(get(&view, b"b"), Some(&[2u8; 19][..]));
        Ok(())
    }

    #[test]
    fn test_tombstones_trigger_index_rebuild() -> Result<()> {
        let mut segment = TestSegment::new(8, 1024);
        let mut view = segment.view();
        insert(&mut view, b"anchor", b"stays")?;

        for round in 0..100u32 {
            let key = round.to_le_bytes();
            let found = insert(&mut view, &key, b"tmp")?;
            view.remove(found);
            assert!(view.reader().header().tombstones as usize * 4 <= view.reader().buckets.len() + 4);
        }
        assert_eq!(get(&view, b"anchor"), Some(&b"stays"[..]));
        assert_eq!(view.len(), 1);
        Ok(())
    }

    #[test]
    fn test_removing_last_entry_resets() -> Result<()> {
        let mut segment = TestSegment::new(8, 128);
        let mut view = segment.view();
        let found = insert(&mut view, b"only", b"entry")?;
        view.remove(found);
        assert_eq!(*view.reader().header(), SegmentHeader::default());
        assert!(view.reader().buckets.iter().all(|&b| b == EMPTY));
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_header() {
        let mut segment = TestSegment::new(8, 128);
        let mut view = segment.view();
        view.header.entries = 3;
        assert!(matches!(view.reader().validate(), Err(HashError::Corrupt(_))));
    }

    #[test]
    fn test_validate_rejects_bad_slots_and_buckets() -> Result<()> {
        let mut segment = TestSegment::new(8, 128);
        let mut view = segment.view();
        let found = insert(&mut view, b"key", b"value")?;
        insert(&mut view, b"other", b"value")?;
        assert!(view.reader().validate().is_ok());

        let good = view.slots[found.slot];
        view.slots[found.slot] = good.with_heap_pos(u32::MAX);
        assert!(matches!(view.reader().validate(), Err(HashError::Corrupt(_))));

        // status bits `0b11` name no variant
        view.slots[found.slot] = good;
        bytemuck::bytes_of_mut(&mut view.slots[found.slot])[0] |= 0b11;
        assert!(matches!(view.reader().validate(), Err(HashError::Corrupt(_))));

        view.slots[found.slot] = good;
        view.buckets[found.bucket] = 7;
        assert!(matches!(view.reader().validate(), Err(HashError::Corrupt(_))));

        view.buckets[found.bucket] = found.slot as u32 + 1;
        assert!(view.reader().validate().is_ok());
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, Vec<u8>),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..24, proptest::collection::vec(any::<u8>(), 0..24)).prop_map(|(k, v)| Op::Put(k, v)),
            (0u8..24).prop_map(Op::Remove),
        ]
    }

    fn check_prop(ops: Vec<Op>) {
        let mut segment = TestSegment::new(32, 1024);
        let mut view = segment.view();
        let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    let key = vec![k; 3];
                    match view.reader().lookup(hash(&key), &key) {
                        Some(found) => view.replace_value(found.slot, &v).unwrap(),
                        None => {
                            insert(&mut view, &key, &v).unwrap();
                        }
                    }
                    model.insert(key, v);
                }
                Op::Remove(k) => {
                    let key = vec![k; 3];
                    if let Some(found) = view.reader().lookup(hash(&key), &key) {
                        view.remove(found);
                    }
                    model.remove(&key);
                }
            }
        }

        assert_eq!(view.len(), model.len());
        for (key, value) in &model {
            assert_eq!(get(&view, key), Some(value.as_slice()));
        }
        let walked: HashMap<Vec<u8>, Vec<u8>> = view
            .reader()
            .entries()
            .map(|(_, k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(walked, model);
        assert!(view.reader().validate().is_ok());
    }

    #[test]
    fn segment_behaves_like_a_hash_map() {
        proptest!(|(ops in proptest::collection::vec(op(), 1..300))| {
            check_prop(ops);
        });
    }
}
