//! A segmented, off-heap, optionally file-persisted concurrent hash container.
//!
//! Keys are hashed and routed to one of a fixed number of segments. Each
//! segment is an independently locked byte region holding a bucket table,
//! entry slots and a record heap. Access to a single key goes through a
//! [`QueryContext`], which holds the segment lock for its whole lifetime;
//! whole-segment access goes through a [`SegmentContext`].
//!
//! The same machinery serves map-like containers (`V` is a value codec) and
//! set-like ones (`V = NoValue`, see [`SegmentedSet`]).

use std::any::TypeId;
use std::convert::Infallible;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxBuildHasher;
use tracing::info;

mod backing;
mod config;
mod context;
mod entry;
mod layout;
mod segment;
mod segment_context;

use backing::Backing;

pub use config::{HashConfig, default_segments};
pub use context::{EncodedKey, QueryContext};
pub use entry::HashEntry;
pub use segment_context::SegmentContext;
pub use segstore::{
    Bytes, BytesDecode, BytesEncode, HashError, Native, NoValue, Result, SegmentStats, Str,
};

/// Set-like container: keys only, no value payload.
pub type SegmentedSet<K, S = FxBuildHasher> = SegmentedHash<K, NoValue, S>;

/// Static description of a container's key codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyType {
    name: &'static str,
    id: TypeId,
}

impl KeyType {
    pub fn of<K: 'static>() -> Self {
        Self {
            name: std::any::type_name::<K>(),
            id: TypeId::of::<K>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

/// A hash container split into independently locked segments.
///
/// `K` and `V` are codecs (see [`BytesEncode`]); `S` hashes the encoded key.
/// The default `FxBuildHasher` is deterministic across processes, which a
/// persisted file relies on.
pub struct SegmentedHash<K, V = NoValue, S = FxBuildHasher> {
    backing: Option<Arc<Backing>>,
    file: Option<PathBuf>,
    segments: usize,
    hasher: S,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: 'static, V: 'static, S> SegmentedHash<K, V, S>
where
    S: BuildHasher + Default,
{
    /// Create a container in anonymous memory.
    pub fn new(config: &HashConfig) -> Result<Self> {
        Self::with_hasher(config, S::default())
    }

    /// Open the container stored in `path`, creating the file if needed.
    ///
    /// An existing file keeps the geometry it was created with. Opening a file
    /// that is already open in this process shares its mapping.
    pub fn persisted_to<P: AsRef<Path>>(path: P, config: &HashConfig) -> Result<Self> {
        Self::persisted_with_hasher(path, config, S::default())
    }
}

impl<K: 'static, V: 'static, S> SegmentedHash<K, V, S>
where
    S: BuildHasher,
{
    pub fn with_hasher(config: &HashConfig, hasher: S) -> Result<Self> {
        let layout = config.layout()?;
        let bytes = layout.total_size()?;
        let backing = Backing::in_memory(
            layout,
            std::any::type_name::<K>(),
            std::any::type_name::<V>(),
        )?;
        info!(
            segments = layout.segments,
            bytes,
            "created in-memory hash container"
        );
        Ok(Self::from_backing(backing, None, hasher))
    }

    pub fn persisted_with_hasher<P: AsRef<Path>>(path: P, config: &HashConfig, hasher: S) -> Result<Self> {
        let path = path.as_ref();
        let backing = Backing::persisted(
            path,
            config.layout()?,
            std::any::type_name::<K>(),
            std::any::type_name::<V>(),
        )?;
        Ok(Self::from_backing(backing, Some(path.to_path_buf()), hasher))
    }

    fn from_backing(backing: Arc<Backing>, file: Option<PathBuf>, hasher: S) -> Self {
        Self {
            segments: backing.layout().segments,
            backing: Some(backing),
            file,
            hasher,
            _marker: PhantomData,
        }
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::of::<K>()
    }
}

impl<K, V, S> SegmentedHash<K, V, S>
where
    S: BuildHasher,
{
    /// The backing file, `None` for in-memory containers.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    /// Live entries over all segments. Each segment is read at a slightly
    /// different moment, so concurrent mutation may skew the sum.
    pub fn long_size(&self) -> u64 {
        self.backing.as_ref().map_or(0, |backing| backing.long_size())
    }

    pub fn is_empty(&self) -> bool {
        self.long_size() == 0
    }

    pub fn is_open(&self) -> bool {
        self.backing.is_some()
    }

    /// Release this instance's handle on the backing memory.
    ///
    /// Other instances sharing the same file keep working; the mapping is
    /// released with the last of them. Calling `close` again does nothing.
    /// Dirty pages are not synced here, call [`flush`](Self::flush) first for that.
    pub fn close(&mut self) {
        if let Some(backing) = self.backing.take() {
            info!(
                file = ?self.file,
                shared_with = Arc::strong_count(&backing) - 1,
                "closed hash container"
            );
        }
    }

    /// Write dirty pages of a file-backed container to disk.
    pub fn flush(&self) -> Result<()> {
        self.backing()?.flush()
    }

    fn backing(&self) -> Result<&Backing> {
        self.backing.as_deref().ok_or(HashError::Closed)
    }

    fn hash_bytes<'a>(&self, bytes: &[u8]) -> u64
    where
        K: BytesEncode<'a>,
    {
        K::hash_alt(bytes, &mut self.hasher.build_hasher())
    }

    fn segment_for_hash(&self, hash: u64) -> usize {
        (hash % self.segments as u64) as usize
    }

    /// The segment `key` is routed to.
    pub fn segment_for_key<'a>(&self, key: &'a <K as BytesEncode<'a>>::EItem) -> Result<usize>
    where
        K: BytesEncode<'a>,
    {
        let bytes = K::bytes_encode(key)?;
        Ok(self.segment_for_hash(self.hash_bytes(&bytes)))
    }

    /// Lock the segment of `key` and look the key up.
    ///
    /// Blocks while another context holds the same segment.
    pub fn query_context<'q>(
        &'q self,
        key: &'q <K as BytesEncode<'q>>::EItem,
    ) -> Result<QueryContext<'q, K, V>>
    where
        K: BytesEncode<'q>,
    {
        let bytes = K::bytes_encode(key)?;
        self.open_context(bytes)
    }

    /// Like [`query_context`](Self::query_context) for a key encoded up front.
    pub fn query_context_encoded<'q>(
        &'q self,
        key: &'q EncodedKey<'_, K>,
    ) -> Result<QueryContext<'q, K, V>>
    where
        K: BytesEncode<'q>,
    {
        self.open_context(std::borrow::Cow::Borrowed(key.as_bytes()))
    }

    fn open_context<'q>(&'q self, key: std::borrow::Cow<'q, [u8]>) -> Result<QueryContext<'q, K, V>>
    where
        K: BytesEncode<'q>,
    {
        let backing = self.backing()?;
        let hash = self.hash_bytes(&key);
        let segment = &backing.segments()[self.segment_for_hash(hash)];
        Ok(QueryContext::open(segment, key, hash))
    }

    pub fn segment_context(&self, index: usize) -> Result<SegmentContext<'_, K, V>> {
        let backing = self.backing()?;
        let segment = backing
            .segments()
            .get(index)
            .ok_or(HashError::SegmentOutOfRange {
                index,
                segments: self.segments,
            })?;
        Ok(SegmentContext::new(segment))
    }

    /// Visit entries segment by segment until `f` returns `false` or fails.
    ///
    /// Returns `Ok(true)` when every entry was visited, including when there
    /// are none. The walk is not a snapshot: entries changed concurrently in
    /// segments not yet reached may or may not be seen.
    pub fn try_for_each_entry_while<E, F>(&self, mut f: F) -> std::result::Result<bool, E>
    where
        F: FnMut(&HashEntry<'_, K, V>) -> std::result::Result<bool, E>,
    {
        let Some(backing) = self.backing.as_deref() else {
            return Ok(true);
        };
        for segment in backing.segments() {
            if !SegmentContext::<K, V>::new(segment).try_for_each_entry_while(&mut f)? {
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

    /// Visit every entry; the first error aborts the walk and is returned.
    pub fn try_for_each_entry<E, F>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&HashEntry<'_, K, V>) -> std::result::Result<(), E>,
    {
        self.try_for_each_entry_while(|entry| f(entry).map(|()| true))
            .map(|_| ())
    }

    pub fn for_each_entry<F>(&self, mut f: F)
    where
        F: FnMut(&HashEntry<'_, K, V>),
    {
        self.for_each_entry_while(|entry| {
            f(entry);
            true
        });
    }
}
