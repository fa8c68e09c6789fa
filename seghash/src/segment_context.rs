use std::convert::Infallible;
use std::marker::PhantomData;

use segstore::{SegmentMut, SegmentRef, SegmentStats};
use tracing::debug;

use crate::entry::HashEntry;
use crate::segment::Segment;

/// Iteration and maintenance over the entries of one segment.
///
/// Unlike a [`QueryContext`](crate::QueryContext) it holds no lock of its own:
/// each call locks the segment for its duration. Walks take the read lock, so
/// a callback must not open a query context on the same container.
pub struct SegmentContext<'a, K, V> {
    segment: &'a Segment,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V> SegmentContext<'a, K, V> {
    pub(crate) fn new(segment: &'a Segment) -> Self {
        Self {
            segment,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.segment.index()
    }

    /// Live entries, without locking.
    pub fn size(&self) -> u64 {
        self.segment.len()
    }

    pub fn stats(&self) -> SegmentStats {
        let guard = self.segment.read();
        SegmentRef::new(guard.as_slice(), self.segment.geometry()).stats()
    }

    /// Visit live entries in slot order until `f` returns `false` or an error.
    pub fn try_for_each_entry_while<E, F>(&self, mut f: F) -> Result<bool, E>
    where
        F: FnMut(&HashEntry<'_, K, V>) -> Result<bool, E>,
    {
        let guard = self.segment.read();
        let view = SegmentRef::new(guard.as_slice(), self.segment.geometry());
        for (slot, key, value) in view.entries() {
            if !f(&HashEntry::new(self.index(), slot, key, value))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn for_each_entry_while<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&HashEntry<'_, K, V>) -> bool,
    {
        match self.try_for_each_entry_while(|entry| Ok::<_, Infallible>(f(entry))) {
            Ok(completed) => completed,
            Err(never) => match never {},
        }
    }

    /// Remove every entry matching `pred`. Returns how many were removed.
    pub fn remove_if<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&HashEntry<'_, K, V>) -> bool,
    {
        let mut guard = self.segment.write();
        let geometry = self.segment.geometry();
        let doomed: Vec<usize> = SegmentRef::new(guard.as_slice(), geometry)
            .entries()
            .filter(|(slot, key, value)| pred(&HashEntry::new(self.index(), *slot, key, value)))
            .map(|(slot, _, _)| slot)
            .collect();

        let mut view = SegmentMut::new(guard.as_mut_slice(), geometry);
        let removed = doomed
            .into_iter()
            .filter(|&slot| view.remove_slot(slot))
            .count();
        self.segment.publish_len(view.len());
        removed
    }

    /// Reclaim heap space held by removed or shrunk records.
    pub fn compact(&self) -> usize {
        let mut guard = self.segment.write();
        let reclaimed = SegmentMut::new(guard.as_mut_slice(), self.segment.geometry()).compact();
        debug!(segment = self.index(), reclaimed, "segment compacted on request");
        reclaimed
    }

    /// Remove every entry. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut guard = self.segment.write();
        let mut view = SegmentMut::new(guard.as_mut_slice(), self.segment.geometry());
        let removed = view.len();
        view.reset();
        self.segment.publish_len(0);
        removed
    }
}
