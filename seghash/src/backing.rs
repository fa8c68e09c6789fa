use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use segstore::{HashError, MemoryRegion, Result};
use tracing::{debug, info, warn};

use crate::layout::{FILE_HEADER_SIZE, FileHeader, Layout, SEGMENTS_OFFSET, stored_name};
use crate::segment::Segment;

/// The memory behind one or more container instances: the mapping and the
/// segments carved from it, locks included.
///
/// File-backed instances of the same path inside one process share a single
/// `Arc<Backing>`; the mapping goes away with the last handle.
pub(crate) struct Backing {
    // dropped before `region`, whose memory the segments point into
    segments: Box<[CachePadded<Segment>]>,
    layout: Layout,
    key_type: String,
    value_type: String,
    region: MemoryRegion,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<Backing>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<Backing>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Backing {
    pub fn in_memory(layout: Layout, key_type: &str, value_type: &str) -> Result<Arc<Self>> {
        let mut region = MemoryRegion::anonymous(layout.total_size()?)?;
        FileHeader::new(&layout, key_type, value_type).write_to(region.header_mut(FILE_HEADER_SIZE)?);
        Ok(Arc::new(Self::carve(region, layout, key_type, value_type)?))
    }

    /// Open `path` or create it with `layout`. A mapping of the same file that
    /// is still alive in this process is shared rather than mapped again.
    pub fn persisted(path: &Path, layout: Layout, key_type: &str, value_type: &str) -> Result<Arc<Self>> {
        let mut registry = registry().lock();
        registry.retain(|_, backing| backing.strong_count() > 0);

        let exists = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if exists {
            let canonical = fs::canonicalize(path)?;
            if let Some(backing) = registry.get(&canonical).and_then(Weak::upgrade) {
                backing.check_types(key_type, value_type)?;
                debug!(path = %canonical.display(), "sharing live mapping");
                return Ok(backing);
            }
        }

        let backing = if exists {
            Self::open_file(path, layout, key_type, value_type)?
        } else {
            Self::create_file(path, layout, key_type, value_type)?
        };
        let backing = Arc::new(backing);
        registry.insert(fs::canonicalize(path)?, Arc::downgrade(&backing));
        Ok(backing)
    }

    fn create_file(path: &Path, layout: Layout, key_type: &str, value_type: &str) -> Result<Self> {
        let bytes = layout.total_size()?;
        let mut region = MemoryRegion::create_file(path, bytes)?;
        FileHeader::new(&layout, key_type, value_type).write_to(region.header_mut(FILE_HEADER_SIZE)?);
        info!(
            path = %path.display(),
            segments = layout.segments,
            bytes,
            "created hash file"
        );
        Self::carve(region, layout, key_type, value_type)
    }

    fn open_file(path: &Path, requested: Layout, key_type: &str, value_type: &str) -> Result<Self> {
        let region = MemoryRegion::open_file(path)?;
        let header = FileHeader::read_from(region.header(FILE_HEADER_SIZE)?)?;
        check_type("key", key_type, &header.key_type())?;
        check_type("value", value_type, &header.value_type())?;

        let layout = header.layout()?;
        if layout != requested {
            warn!(
                path = %path.display(),
                file_segments = layout.segments,
                file_slots = layout.geometry.slots(),
                "configured geometry differs from the file, using the file's"
            );
        }
        let needed = layout
            .total_size()
            .map_err(|e| HashError::Corrupt(e.to_string()))?;
        if region.len() < needed {
            return Err(HashError::Corrupt(format!(
                "{} holds {} bytes, layout needs {needed}",
                path.display(),
                region.len(),
            )));
        }

        let backing = Self::carve(region, layout, key_type, value_type)?;
        info!(
            path = %path.display(),
            segments = layout.segments,
            entries = backing.long_size(),
            "opened hash file"
        );
        Ok(backing)
    }

    fn carve(region: MemoryRegion, layout: Layout, key_type: &str, value_type: &str) -> Result<Self> {
        // SAFETY: the slices end up in `segments`, which is dropped before `region`.
        let slices = unsafe { region.carve(SEGMENTS_OFFSET, layout.region_size(), layout.segments)? };
        let segments = slices
            .into_iter()
            .enumerate()
            .map(|(index, slice)| Segment::new(index, slice, layout.geometry).map(CachePadded::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            segments: segments.into_boxed_slice(),
            layout,
            key_type: stored_name(key_type),
            value_type: stored_name(value_type),
            region,
        })
    }

    fn check_types(&self, key_type: &str, value_type: &str) -> Result<()> {
        check_type("key", key_type, &self.key_type)?;
        check_type("value", value_type, &self.value_type)
    }

    pub fn segments(&self) -> &[CachePadded<Segment>] {
        &self.segments
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn long_size(&self) -> u64 {
        self.segments.iter().map(|segment| segment.len()).sum()
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }
}

fn check_type(what: &'static str, expected: &str, found: &str) -> Result<()> {
    let expected = stored_name(expected);
    if expected != found {
        return Err(HashError::TypeMismatch {
            what,
            expected,
            found: found.to_string(),
        });
    }
    Ok(())
}
