use std::marker::PhantomData;

use segstore::{BytesDecode, Result};

/// A live entry seen through a query or segment context.
///
/// Borrows the segment's memory, so it can only exist while the lock that
/// produced it is held.
pub struct HashEntry<'a, K, V> {
    segment: usize,
    slot: usize,
    key: &'a [u8],
    value: &'a [u8],
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V> HashEntry<'a, K, V> {
    pub(crate) fn new(segment: usize, slot: usize, key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            segment,
            slot,
            key,
            value,
            _marker: PhantomData,
        }
    }

    pub fn segment_index(&self) -> usize {
        self.segment
    }

    /// Entry slot inside the segment. Stable until the entry is removed.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn key_bytes(&self) -> &'a [u8] {
        self.key
    }

    /// Empty for membership-only entries.
    pub fn value_bytes(&self) -> &'a [u8] {
        self.value
    }

    pub fn key(&self) -> Result<<K as BytesDecode<'a>>::DItem>
    where
        K: BytesDecode<'a>,
    {
        K::bytes_decode(self.key)
    }

    pub fn value(&self) -> Result<<V as BytesDecode<'a>>::DItem>
    where
        V: BytesDecode<'a>,
    {
        V::bytes_decode(self.value)
    }
}

impl<K, V> std::fmt::Debug for HashEntry<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashEntry")
            .field("segment", &self.segment)
            .field("slot", &self.slot)
            .field("key_len", &self.key.len())
            .field("value_len", &self.value.len())
            .finish()
    }
}
