use bytemuck::{Pod, Zeroable};
use segstore::{HashError, Result, SegmentGeometry};

pub(crate) const MAGIC: [u8; 8] = *b"SEGHASH\0";
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Segments start on the page after the header.
pub(crate) const SEGMENTS_OFFSET: usize = 4096;

const TYPE_NAME_LEN: usize = 64;

/// Where every segment sits inside the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub segments: usize,
    pub geometry: SegmentGeometry,
}

impl Layout {
    pub fn region_size(&self) -> usize {
        self.geometry.region_size()
    }

    /// Bytes of the whole mapping, header page included.
    pub fn total_size(&self) -> Result<usize> {
        self.segments
            .checked_mul(self.region_size())
            .and_then(|segments| segments.checked_add(SEGMENTS_OFFSET))
            .ok_or_else(|| {
                HashError::InvalidConfig(format!(
                    "{} segments of {} bytes overflow the address space",
                    self.segments,
                    self.region_size()
                ))
            })
    }
}

/// First bytes of every container mapping.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct FileHeader {
    magic: [u8; 8],
    version: u32,
    segments: u32,
    slots_per_segment: u64,
    heap_bytes_per_segment: u64,
    segment_region_size: u64,
    segments_offset: u64,
    key_type: [u8; TYPE_NAME_LEN],
    value_type: [u8; TYPE_NAME_LEN],
}

pub(crate) const FILE_HEADER_SIZE: usize = std::mem::size_of::<FileHeader>();

impl FileHeader {
    pub fn new(layout: &Layout, key_type: &str, value_type: &str) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            segments: layout.segments as u32,
            slots_per_segment: layout.geometry.slots() as u64,
            heap_bytes_per_segment: layout.geometry.heap_bytes() as u64,
            segment_region_size: layout.region_size() as u64,
            segments_offset: SEGMENTS_OFFSET as u64,
            key_type: encode_name(key_type),
            value_type: encode_name(value_type),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..FILE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(HashError::Corrupt(format!(
                "header needs {FILE_HEADER_SIZE} bytes, found {}",
                bytes.len()
            )));
        }
        let header: FileHeader = bytemuck::pod_read_unaligned(&bytes[..FILE_HEADER_SIZE]);
        if header.magic != MAGIC {
            return Err(HashError::Corrupt("bad magic".to_string()));
        }
        if header.version != FORMAT_VERSION {
            return Err(HashError::Corrupt(format!(
                "unsupported format version {}",
                header.version
            )));
        }
        Ok(header)
    }

    /// The layout recorded in the header, checked for self-consistency.
    pub fn layout(&self) -> Result<Layout> {
        let geometry = SegmentGeometry::new(
            self.slots_per_segment as usize,
            self.heap_bytes_per_segment as usize,
        )
        .map_err(|e| HashError::Corrupt(e.to_string()))?;
        let layout = Layout {
            segments: self.segments as usize,
            geometry,
        };
        if layout.segments == 0
            || self.segments_offset != SEGMENTS_OFFSET as u64
            || self.segment_region_size != layout.region_size() as u64
        {
            return Err(HashError::Corrupt(format!(
                "inconsistent layout: {} segments of {} bytes at offset {}",
                self.segments, self.segment_region_size, self.segments_offset
            )));
        }
        layout
            .total_size()
            .map_err(|e| HashError::Corrupt(e.to_string()))?;
        Ok(layout)
    }

    pub fn key_type(&self) -> String {
        decode_name(&self.key_type)
    }

    pub fn value_type(&self) -> String {
        decode_name(&self.value_type)
    }
}

fn encode_name(name: &str) -> [u8; TYPE_NAME_LEN] {
    let mut out = [0u8; TYPE_NAME_LEN];
    let len = name.len().min(TYPE_NAME_LEN);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

fn decode_name(bytes: &[u8; TYPE_NAME_LEN]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(TYPE_NAME_LEN);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A type name as the header stores it.
pub(crate) fn stored_name(name: &str) -> String {
    decode_name(&encode_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use segstore::segment::MAX_SLOTS;

    fn layout() -> Layout {
        Layout {
            segments: 4,
            geometry: SegmentGeometry::new(64, 2048).unwrap(),
        }
    }

    #[test]
    fn test_header_fits_first_page() {
        assert!(FILE_HEADER_SIZE <= SEGMENTS_OFFSET);
        assert_eq!(FILE_HEADER_SIZE % 8, 0);
    }

    #[test]
    fn test_header_restores_layout_and_types() -> Result<()> {
        let mut page = vec![0u8; SEGMENTS_OFFSET];
        FileHeader::new(&layout(), "segstore::types::Str", "u64").write_to(&mut page);

        let header = FileHeader::read_from(&page)?;
        assert_eq!(header.layout()?, layout());
        assert_eq!(header.key_type(), "segstore::types::Str");
        assert_eq!(header.value_type(), "u64");
        assert_eq!(layout().total_size()?, 4096 + 4 * layout().region_size());
        Ok(())
    }

    #[test]
    fn test_header_rejects_garbage() {
        let page = vec![0u8; SEGMENTS_OFFSET];
        assert!(matches!(FileHeader::read_from(&page), Err(HashError::Corrupt(_))));
        assert!(matches!(FileHeader::read_from(&page[..10]), Err(HashError::Corrupt(_))));

        let mut header = FileHeader::new(&layout(), "k", "v");
        header.segment_region_size += 64;
        assert!(matches!(header.layout(), Err(HashError::Corrupt(_))));
    }

    #[test]
    fn test_oversized_layout_is_an_error() -> Result<()> {
        let huge = Layout {
            segments: u32::MAX as usize,
            geometry: SegmentGeometry::new(MAX_SLOTS, u32::MAX as usize)?,
        };
        assert!(matches!(huge.total_size(), Err(HashError::InvalidConfig(_))));

        let header = FileHeader::new(&huge, "k", "v");
        assert!(matches!(header.layout(), Err(HashError::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn test_long_type_names_are_truncated() {
        let long = "x".repeat(100);
        let stored = stored_name(&long);
        assert_eq!(stored.len(), TYPE_NAME_LEN);
        let header = FileHeader::new(&layout(), &long, "v");
        assert_eq!(header.key_type(), stored);
    }
}
