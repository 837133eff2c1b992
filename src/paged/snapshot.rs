use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{CombError, Result};
use crate::paged::codec::{self, Codec};
use crate::paged::file::{PageFile, Slice, SliceMode};
use crate::paged::PageId;

/// Decoded objects cached per snapshot.
const SNAPSHOT_CACHE_CAPACITY: usize = 1024;

/// Sanity bound on object frame lengths read back from disk.
const MAX_OBJECT_LEN: usize = 1 << 30;

/// Where reads of a logical page land after the commits this table has
/// absorbed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Redirect {
    /// Content lives at the given physical page.
    To(PageId),
    /// The page was freed; reading it is a contract violation.
    Freed,
}

/// Immutable logical-to-physical page map published at a commit boundary.
#[derive(Debug, Default)]
pub struct PageTable {
    version: u64,
    redirects: HashMap<PageId, Redirect>,
}

impl PageTable {
    pub(crate) fn new(version: u64, redirects: HashMap<PageId, Redirect>) -> Self {
        Self { version, redirects }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn redirects(&self) -> &HashMap<PageId, Redirect> {
        &self.redirects
    }

    /// Physical location of a logical page under this table.
    pub fn resolve(&self, page: PageId) -> Result<PageId> {
        match self.redirects.get(&page) {
            None => Ok(page),
            Some(Redirect::To(target)) => Ok(*target),
            Some(Redirect::Freed) => Err(CombError::Paging("read of a freed page")),
        }
    }

    /// Physical location ignoring free markers; used when superseding.
    pub(crate) fn resolve_lenient(&self, page: PageId) -> PageId {
        match self.redirects.get(&page) {
            Some(Redirect::To(target)) => *target,
            _ => page,
        }
    }
}

/// Immutable read view of the paged state at a commit boundary.
///
/// Snapshots are handed out by the engine with a per-version reference
/// count; while any reference is live, no page the snapshot can observe is
/// reused. Each snapshot owns a bounded cache of decoded objects keyed by
/// their first page.
pub struct Snapshot {
    table: Arc<PageTable>,
    file: PageFile,
    cache: Mutex<LruCache<PageId, Arc<dyn Any + Send + Sync>>>,
}

impl Snapshot {
    pub(crate) fn new(table: Arc<PageTable>, file: PageFile) -> Self {
        let capacity = NonZeroUsize::new(SNAPSHOT_CACHE_CAPACITY).unwrap();
        Self {
            table,
            file,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn version(&self) -> u64 {
        self.table.version()
    }

    pub(crate) fn table(&self) -> &Arc<PageTable> {
        &self.table
    }

    /// Reads a logical page through the redirect table.
    pub fn read(&self, page: PageId, buf: &mut [u8]) -> Result<()> {
        let physical = self.table.resolve(page)?;
        self.file.read(physical, buf)
    }

    /// Opens a read-only byte window over `count` logical pages starting
    /// at `page`.
    ///
    /// Every page in the range resolves through the redirect table on its
    /// own; commits may have scattered their physical locations.
    pub fn slice(&self, page: PageId, count: u32) -> Result<Slice> {
        let mut physical = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            physical.push(self.table.resolve(PageId(page.0 + i))?);
        }
        let contiguous = physical.windows(2).all(|pair| pair[1].0 == pair[0].0 + 1);
        match physical.first() {
            Some(first) if contiguous => self.file.slice(SliceMode::Read, *first, count),
            _ => self.file.gather(&physical),
        }
    }

    /// Loads a decoded object, caching it for the snapshot's lifetime.
    pub fn cache_load<T, C>(&self, codec: &C, page: PageId) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
    {
        if let Some(cached) = self.cache.lock().get(&page) {
            return Arc::clone(cached)
                .downcast::<T>()
                .map_err(|_| CombError::Paging("cached object type mismatch"));
        }
        let bytes = self.read_object_bytes(page)?;
        let value: Arc<T> = Arc::new(codec.decode(&bytes)?);
        self.cache
            .lock()
            .put(page, Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        Ok(value)
    }

    /// Reads the framed byte payload of a stored object.
    pub(crate) fn read_object_bytes(&self, page: PageId) -> Result<Vec<u8>> {
        let page_size = self.file.page_size() as usize;
        let mut first = vec![0u8; page_size];
        self.read(page, &mut first)?;
        let len = codec::framed_len(&first)?;
        if len > MAX_OBJECT_LEN {
            return Err(CombError::Corruption("object frame length implausible"));
        }
        let total = codec::OBJECT_FRAME_HDR + len;
        if total <= page_size {
            return Ok(first[codec::OBJECT_FRAME_HDR..total].to_vec());
        }
        let window = self.slice(page, self.file.pages(total))?;
        let bytes = window.data()[codec::OBJECT_FRAME_HDR..total].to_vec();
        self.file.unslice(window)?;
        Ok(bytes)
    }
}
