use std::io;
use thiserror::Error;

/// Errors that can occur when working with segmented hash storage
#[derive(Error, Debug)]
pub enum HashError {
    /// IO errors when creating, mapping or flushing a backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Encoding errors when converting a key or value to bytes
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Decoding errors when converting stored bytes back to data
    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("segment index {index} out of range for {segments} segments")]
    SegmentOutOfRange { index: usize, segments: usize },

    /// Every entry slot of the segment is in use
    #[error("segment full: all {capacity} entry slots in use")]
    SegmentFull { capacity: usize },

    /// The record heap has no room left, even after compaction
    #[error("segment heap exhausted: need {needed} bytes, {available} available")]
    HeapExhausted { needed: usize, available: usize },

    #[error("entry of {size} bytes can never fit a segment heap of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },

    #[error("hash container is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persisted bytes do not describe a valid container
    #[error("corrupt hash file: {0}")]
    Corrupt(String),

    #[error("{what} type mismatch: file stores {found}, opened as {expected}")]
    TypeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },
}

pub type Result<T> = std::result::Result<T, HashError>;
