//! Storage primitives for segmented off-heap hash containers.
//!
//! A [`MemoryRegion`] is carved into one [`RegionSlice`] per segment. Each
//! slice holds a self-describing segment (see [`segment`]) that is read and
//! written through [`SegmentRef`] and [`SegmentMut`]. Locking lives one level
//! up, in `seghash`.

pub mod entry;
pub mod error;
pub mod region;
pub mod segment;
pub mod types;

pub use entry::{ENTRY_SIZE, EntrySlot, SlotStatus};
pub use error::{HashError, Result};
pub use region::{MemoryRegion, RegionSlice};
pub use segment::{Found, SegmentGeometry, SegmentHeader, SegmentMut, SegmentRef, SegmentStats};
pub use types::{Bytes, BytesDecode, BytesEncode, Native, NoValue, Str};
