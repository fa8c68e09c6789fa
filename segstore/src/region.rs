use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::OnceLock;

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{HashError, Result};

/// A contiguous mapping that backs every segment of one container.
///
/// The leading bytes hold the container header; the rest is carved once into
/// disjoint [`RegionSlice`]s, one per segment. Anonymous regions are private
/// to the process, file regions are shared mappings of the file.
pub struct MemoryRegion {
    raw: MmapRaw,
    file: Option<File>,
    path: Option<PathBuf>,
    carved_at: OnceLock<usize>,
}

impl MemoryRegion {
    /// Zero-filled private memory of `len` bytes.
    pub fn anonymous(len: usize) -> Result<Self> {
        let mmap = MmapOptions::new().len(len).map_anon()?;
        Ok(Self {
            raw: MmapRaw::from(mmap),
            file: None,
            path: None,
            carved_at: OnceLock::new(),
        })
    }

    /// Open or create `path`, extend it to at least `len` bytes and map it.
    pub fn create_file(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        Self::map_file(file, path)
    }

    /// Map an existing file at its current length.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(HashError::Corrupt(format!(
                "{} is empty",
                path.display()
            )));
        }
        Self::map_file(file, path)
    }

    fn map_file(file: File, path: &Path) -> Result<Self> {
        let raw = MmapOptions::new().map_raw(&file)?;
        Ok(Self {
            raw,
            file: Some(file),
            path: Some(path.to_path_buf()),
            carved_at: OnceLock::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    /// The first `len` bytes. They may not reach into carved segment ranges.
    pub fn header(&self, len: usize) -> Result<&[u8]> {
        self.check_header_len(len)?;
        // SAFETY: the range is inside the mapping and disjoint from every
        // carved slice, so no `&mut` to it exists.
        Ok(unsafe { std::slice::from_raw_parts(self.raw.as_ptr(), len) })
    }

    /// Mutable header access, only before the segments were carved.
    pub fn header_mut(&mut self, len: usize) -> Result<&mut [u8]> {
        if self.carved_at.get().is_some() {
            return Err(HashError::InvalidConfig(
                "header is read-only once segments are carved".to_string(),
            ));
        }
        self.check_header_len(len)?;
        // SAFETY: nothing was carved and `&mut self` excludes other borrows.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.raw.as_mut_ptr(), len) })
    }

    fn check_header_len(&self, len: usize) -> Result<()> {
        let limit = self.carved_at.get().copied().unwrap_or(self.len());
        if len > limit {
            return Err(HashError::InvalidConfig(format!(
                "header of {len} bytes exceeds the {limit} bytes available"
            )));
        }
        Ok(())
    }

    /// Split `count` ranges of `size` bytes, starting at `offset`.
    ///
    /// A region is carved at most once, so the slices never alias each other.
    ///
    /// # Safety
    ///
    /// The returned slices point into this mapping and must be dropped before
    /// the region is.
    pub unsafe fn carve(&self, offset: usize, size: usize, count: usize) -> Result<Vec<RegionSlice>> {
        let end = size
            .checked_mul(count)
            .and_then(|total| total.checked_add(offset))
            .ok_or_else(|| HashError::InvalidConfig("segment layout overflows".to_string()))?;
        if end > self.len() {
            return Err(HashError::InvalidConfig(format!(
                "{count} segments of {size} bytes at offset {offset} exceed a region of {} bytes",
                self.len()
            )));
        }
        if self.carved_at.set(offset).is_err() {
            return Err(HashError::InvalidConfig("region already carved".to_string()));
        }

        let base = self.raw.as_mut_ptr();
        let slices = (0..count)
            .map(|i| {
                // SAFETY: `offset + i * size` stays within the mapping (checked above).
                let start = unsafe { base.add(offset + i * size) };
                RegionSlice {
                    ptr: NonNull::new(start).unwrap_or(NonNull::dangling()),
                    len: size,
                }
            })
            .collect();
        Ok(slices)
    }

    /// Write dirty pages of a file-backed region to disk.
    pub fn flush(&self) -> Result<()> {
        if self.file.is_some() {
            self.raw.flush()?;
        }
        Ok(())
    }
}

/// One segment's byte range inside a [`MemoryRegion`].
pub struct RegionSlice {
    ptr: NonNull<u8>,
    len: usize,
}

// Slices cover disjoint ranges and hand out access only through `&self`/`&mut self`.
unsafe impl Send for RegionSlice {}
unsafe impl Sync for RegionSlice {}

impl RegionSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range belongs to this slice alone and the mapping outlives it.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
