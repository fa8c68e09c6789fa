use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use segstore::{RegionSlice, Result, SegmentGeometry, SegmentRef};

/// One shard of the key space: its region behind its own lock.
///
/// `entries` mirrors the live count stored in the region header so that the
/// container size can be summed without taking any lock.
pub(crate) struct Segment {
    index: usize,
    geometry: SegmentGeometry,
    region: RwLock<RegionSlice>,
    entries: AtomicU64,
}

impl Segment {
    pub fn new(index: usize, region: RegionSlice, geometry: SegmentGeometry) -> Result<Self> {
        let view = SegmentRef::new(region.as_slice(), &geometry);
        view.validate()?;
        let entries = view.len() as u64;
        Ok(Self {
            index,
            geometry,
            region: RwLock::new(region),
            entries: AtomicU64::new(entries),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> &SegmentGeometry {
        &self.geometry
    }

    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Acquire)
    }

    /// Called with the write lock held after every mutation.
    pub fn publish_len(&self, entries: usize) {
        self.entries.store(entries as u64, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RegionSlice> {
        self.region.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RegionSlice> {
        self.region.write()
    }
}
