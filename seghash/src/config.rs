use std::path::Path;
use std::sync::OnceLock;

use segstore::{HashError, Result, SegmentGeometry};

use crate::SegmentedHash;
use crate::layout::Layout;

/// Available parallelism times four, rounded up to a power of two.
pub fn default_segments() -> usize {
    static DEFAULT_SEGMENTS: OnceLock<usize> = OnceLock::new();
    *DEFAULT_SEGMENTS.get_or_init(|| {
        (std::thread::available_parallelism().map_or(1, usize::from) * 4).next_power_of_two()
    })
}

/// Sizing of a hash container, fixed when it is created.
///
/// Every segment gets `entries_per_segment` entry slots and a record heap sized
/// from the average key and value sizes with room for fragmentation. Inserts
/// into a segment whose slots or heap are used up fail instead of growing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashConfig {
    /// Number of segments. Keys are routed by `hash % segments`.
    pub segments: usize,

    /// Entry slots per segment.
    pub entries_per_segment: usize,

    /// Expected encoded key size in bytes.
    pub average_key_size: usize,

    /// Expected encoded value size in bytes; `0` for set-like containers.
    pub average_value_size: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            segments: default_segments(),
            entries_per_segment: 1024,
            average_key_size: 32,
            average_value_size: 64,
        }
    }
}

impl HashConfig {
    /// Room for `entries` keys spread over the default segment count, with a
    /// quarter of slack for uneven distribution.
    pub fn for_entries(entries: usize) -> Self {
        let segments = default_segments();
        Self {
            segments,
            entries_per_segment: (entries.div_ceil(segments) * 5 / 4).max(16),
            ..Self::default()
        }
    }

    pub fn heap_bytes_per_segment(&self) -> usize {
        let record = (self.average_key_size + self.average_value_size).max(1);
        (self.entries_per_segment.saturating_mul(record) / 2 * 3).max(64)
    }

    pub fn geometry(&self) -> Result<SegmentGeometry> {
        SegmentGeometry::new(self.entries_per_segment, self.heap_bytes_per_segment())
    }

    pub(crate) fn layout(&self) -> Result<Layout> {
        if self.segments == 0 || self.segments > u32::MAX as usize {
            return Err(HashError::InvalidConfig(format!(
                "segment count must be in 1..={}, got {}",
                u32::MAX,
                self.segments
            )));
        }
        let layout = Layout {
            segments: self.segments,
            geometry: self.geometry()?,
        };
        layout.total_size()?;
        Ok(layout)
    }

    /// A container held in anonymous memory.
    pub fn create<K: 'static, V: 'static>(&self) -> Result<SegmentedHash<K, V>> {
        SegmentedHash::new(self)
    }

    /// A container backed by `path`, created if missing.
    pub fn create_persisted_to<K: 'static, V: 'static>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<SegmentedHash<K, V>> {
        SegmentedHash::persisted_to(path, self)
    }
}
