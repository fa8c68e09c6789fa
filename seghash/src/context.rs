use std::borrow::Cow;
use std::marker::PhantomData;

use parking_lot::RwLockWriteGuard;
use segstore::{
    BytesDecode, BytesEncode, Found, NoValue, RegionSlice, Result, SegmentMut, SegmentRef,
};

use crate::entry::HashEntry;
use crate::segment::Segment;

/// A key already turned into its stored byte form.
///
/// Opening contexts with an encoded key skips the encoding step; routing and
/// lookup are the same as for the plain key.
pub struct EncodedKey<'a, K> {
    bytes: Cow<'a, [u8]>,
    _marker: PhantomData<fn() -> K>,
}

impl<'a, K> EncodedKey<'a, K> {
    pub fn encode(key: &'a <K as BytesEncode<'a>>::EItem) -> Result<Self>
    where
        K: BytesEncode<'a>,
    {
        Ok(Self {
            bytes: K::bytes_encode(key)?,
            _marker: PhantomData,
        })
    }

    /// Wrap bytes that are known to be a valid encoding of a `K`.
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
            _marker: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<K> EncodedKey<'static, K> {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Cow::Owned(bytes),
            _marker: PhantomData,
        }
    }
}

/// Exclusive access to the entry of one key.
///
/// Holds the write lock of the key's segment from creation until drop, so
/// every other context on the same segment waits. The lookup happens once at
/// creation; afterwards the context is either in the found or the absent
/// state and each mutation moves it between the two.
///
/// Do not open a second context on the same container while holding one:
/// two keys of the same segment deadlock.
pub struct QueryContext<'q, K, V> {
    segment: &'q Segment,
    guard: RwLockWriteGuard<'q, RegionSlice>,
    key: Cow<'q, [u8]>,
    hash: u64,
    found: Option<Found>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'q, K, V> QueryContext<'q, K, V> {
    pub(crate) fn open(segment: &'q Segment, key: Cow<'q, [u8]>, hash: u64) -> Self {
        let guard = segment.write();
        let found = SegmentRef::new(guard.as_slice(), segment.geometry()).lookup(hash, &key);
        Self {
            segment,
            guard,
            key,
            hash,
            found,
            _marker: PhantomData,
        }
    }

    fn view(&self) -> SegmentRef<'_> {
        SegmentRef::new(self.guard.as_slice(), self.segment.geometry())
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn key<'s>(&'s self) -> Result<<K as BytesDecode<'s>>::DItem>
    where
        K: BytesDecode<'s>,
    {
        K::bytes_decode(&self.key)
    }

    pub fn segment_index(&self) -> usize {
        self.segment.index()
    }

    pub fn is_present(&self) -> bool {
        self.found.is_some()
    }

    pub fn entry(&self) -> Option<HashEntry<'_, K, V>> {
        let found = self.found?;
        let view = self.view();
        Some(HashEntry::new(
            self.segment.index(),
            found.slot,
            view.key(found.slot),
            view.value(found.slot),
        ))
    }

    pub fn value_bytes(&self) -> Option<&[u8]> {
        self.found.map(|found| self.view().value(found.slot))
    }

    pub fn value<'s>(&'s self) -> Result<Option<<V as BytesDecode<'s>>::DItem>>
    where
        V: BytesDecode<'s>,
    {
        self.value_bytes().map(V::bytes_decode).transpose()
    }

    /// Insert when absent. Returns `false`, changing nothing, if the key is present.
    pub fn insert_bytes(&mut self, value: &[u8]) -> Result<bool> {
        if self.found.is_some() {
            return Ok(false);
        }
        let mut view = SegmentMut::new(self.guard.as_mut_slice(), self.segment.geometry());
        let found = view.insert(self.hash, &self.key, value)?;
        self.segment.publish_len(view.len());
        self.found = Some(found);
        Ok(true)
    }

    /// Replace the value when present. Returns `false` if the key is absent.
    pub fn replace_value_bytes(&mut self, value: &[u8]) -> Result<bool> {
        let Some(found) = self.found else {
            return Ok(false);
        };
        let mut view = SegmentMut::new(self.guard.as_mut_slice(), self.segment.geometry());
        view.replace_value(found.slot, value)?;
        Ok(true)
    }

    /// Insert or replace.
    pub fn put_bytes(&mut self, value: &[u8]) -> Result<()> {
        if !self.replace_value_bytes(value)? {
            self.insert_bytes(value)?;
        }
        Ok(())
    }

    pub fn insert<'v>(&mut self, value: &'v <V as BytesEncode<'v>>::EItem) -> Result<bool>
    where
        V: BytesEncode<'v>,
    {
        let bytes = V::bytes_encode(value)?;
        self.insert_bytes(&bytes)
    }

    pub fn replace_value<'v>(&mut self, value: &'v <V as BytesEncode<'v>>::EItem) -> Result<bool>
    where
        V: BytesEncode<'v>,
    {
        let bytes = V::bytes_encode(value)?;
        self.replace_value_bytes(&bytes)
    }

    pub fn put<'v>(&mut self, value: &'v <V as BytesEncode<'v>>::EItem) -> Result<()>
    where
        V: BytesEncode<'v>,
    {
        let bytes = V::bytes_encode(value)?;
        self.put_bytes(&bytes)
    }

    /// Remove the entry. Returns `false` if the key was absent.
    pub fn remove(&mut self) -> bool {
        let Some(found) = self.found.take() else {
            return false;
        };
        let mut view = SegmentMut::new(self.guard.as_mut_slice(), self.segment.geometry());
        view.remove(found);
        self.segment.publish_len(view.len());
        true
    }

    /// Release the segment lock now instead of at the end of the scope.
    pub fn close(self) {}
}

impl<K> QueryContext<'_, K, NoValue> {
    /// Add the key as a member. Returns `false` if it already was one.
    pub fn add(&mut self) -> Result<bool> {
        self.insert_bytes(&[])
    }
}
