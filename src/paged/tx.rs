use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CombError, Result};
use crate::paged::allocator::Allocator;
use crate::paged::codec::{self, Codec};
use crate::paged::engine::TxPageFile;
use crate::paged::file::{Slice, SliceMode};
use crate::paged::snapshot::Snapshot;
use crate::paged::PageId;

/// Local state of a page inside a transaction's update map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Update {
    /// Freed within this transaction.
    Freed,
    /// Allocated fresh within this transaction; content lives in place.
    Allocated,
    /// Pre-existing page whose new content lives at the given page.
    Remapped(PageId),
}

/// A typed value buffered in memory until commit, together with the page
/// its encoding will land on.
pub(crate) struct DeferredUpdate {
    target: PageId,
    value: Arc<dyn Any + Send + Sync>,
    encode: Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>> + Send + Sync>,
}

impl DeferredUpdate {
    fn new<T, C>(target: PageId, value: T, codec: &C) -> Self
    where
        T: Send + Sync + 'static,
        C: Codec<T> + Clone + 'static,
    {
        let codec = codec.clone();
        Self {
            target,
            value: Arc::new(value),
            encode: Box::new(move |any| {
                let value = any
                    .downcast_ref::<T>()
                    .ok_or(CombError::Paging("deferred value type mismatch"))?;
                codec::frame_object(codec.encode(value)?)
            }),
        }
    }

    fn reset<T, C>(&mut self, value: T, codec: &C)
    where
        T: Send + Sync + 'static,
        C: Codec<T> + Clone + 'static,
    {
        *self = Self::new(self.target, value, codec);
    }

    pub(crate) fn target(&self) -> PageId {
        self.target
    }

    /// Encodes the buffered value, framed for storage.
    pub(crate) fn encode_framed(&self) -> Result<Vec<u8>> {
        (self.encode)(self.value.as_ref())
    }
}

/// A single-threaded unit of isolation against the paged engine.
///
/// The snapshot, update map, and deferred-update map are all created
/// lazily; a transaction that never writes stays read-only. Callers must
/// not share a transaction across threads.
pub struct Transaction {
    engine: Arc<TxPageFile>,
    snapshot: Option<Arc<Snapshot>>,
    updates: Option<HashMap<PageId, Update>>,
    deferred: Option<HashMap<PageId, DeferredUpdate>>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<TxPageFile>) -> Self {
        Self {
            engine,
            snapshot: None,
            updates: None,
            deferred: None,
        }
    }

    /// The read view this transaction observes, opened on first use.
    pub fn snapshot(&mut self) -> &Arc<Snapshot> {
        let engine = &self.engine;
        self.snapshot
            .get_or_insert_with(|| engine.open_snapshot())
    }

    pub fn is_read_only(&self) -> bool {
        self.updates.is_none()
    }

    pub fn page_size(&self) -> u32 {
        self.engine.page_size()
    }

    /// Number of pages needed to hold `byte_len` bytes.
    pub fn pages(&self, byte_len: usize) -> u32 {
        self.engine.pages(byte_len)
    }

    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// The transaction-scoped allocator view.
    pub fn allocator(&mut self) -> TxAllocator<'_> {
        TxAllocator { tx: self }
    }

    fn updates_mut(&mut self) -> &mut HashMap<PageId, Update> {
        self.updates.get_or_insert_with(HashMap::new)
    }

    fn deferred_mut(&mut self) -> &mut HashMap<PageId, DeferredUpdate> {
        self.deferred.get_or_insert_with(HashMap::new)
    }

    fn local_update(&self, page: PageId) -> Option<Update> {
        self.updates.as_ref().and_then(|m| m.get(&page)).copied()
    }

    /// Reads a typed value: buffered deferred updates win, then the
    /// snapshot's object cache.
    pub fn get<T, C>(&mut self, codec: &C, page: PageId) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
    {
        if let Some(update) = self.deferred.as_ref().and_then(|m| m.get(&page)) {
            return Arc::clone(&update.value)
                .downcast::<T>()
                .map_err(|_| CombError::Paging("deferred value type mismatch"));
        }
        if let Some(Update::Freed) = self.local_update(page) {
            return Err(CombError::Paging("read of a freed page"));
        }
        let snapshot = self.snapshot();
        snapshot.cache_load(codec, page)
    }

    /// Upserts a typed value; the encoding is deferred until commit.
    pub fn put<T, C>(&mut self, codec: &C, page: PageId, value: T) -> Result<()>
    where
        T: Send + Sync + 'static,
        C: Codec<T> + Clone + 'static,
    {
        match self.local_update(page) {
            None => {
                // First update of this page: pin the read view and reserve
                // the page the encoding will land on.
                self.snapshot();
                let target = self.engine.alloc_raw(1)?;
                self.updates_mut().insert(page, Update::Remapped(target));
                self.deferred_mut()
                    .insert(page, DeferredUpdate::new(target, value, codec));
                Ok(())
            }
            Some(Update::Freed) => Err(CombError::Paging("write of a freed page")),
            Some(Update::Allocated) => {
                self.deferred_mut()
                    .insert(page, DeferredUpdate::new(page, value, codec));
                Ok(())
            }
            Some(Update::Remapped(_)) => match self.deferred_mut().get_mut(&page) {
                Some(update) => {
                    update.reset(value, codec);
                    Ok(())
                }
                None => Err(CombError::Paging(
                    "cannot mix cached and raw updates to the same page",
                )),
            },
        }
    }

    /// Removes a stored value; the codec schedules the page frees.
    pub fn remove<T, C>(&mut self, codec: &C, page: PageId) -> Result<()>
    where
        C: Codec<T>,
    {
        codec.remove(self, page)
    }

    /// Reads raw bytes from a logical page.
    pub fn read(&mut self, page: PageId, buf: &mut [u8]) -> Result<()> {
        match self.local_update(page) {
            Some(Update::Freed) | Some(Update::Allocated) => Err(CombError::Paging(
                "read of a page that was allocated or freed in this transaction",
            )),
            Some(Update::Remapped(target)) => self.engine.file().read(target, buf),
            None => {
                let snapshot = self.snapshot();
                snapshot.read(page, buf)
            }
        }
    }

    /// Writes raw bytes to a logical page, remapping on first write.
    pub fn write(&mut self, page: PageId, buf: &[u8]) -> Result<()> {
        match self.local_update(page) {
            None => {
                self.snapshot();
                let target = self.engine.alloc_raw(1)?;
                self.updates_mut().insert(page, Update::Remapped(target));
                self.engine.file().write(target, buf)
            }
            Some(Update::Freed) => Err(CombError::Paging("write of a freed page")),
            Some(Update::Allocated) => self.engine.file().write(page, buf),
            Some(Update::Remapped(target)) => {
                if self.deferred.as_ref().is_some_and(|m| m.contains_key(&page)) {
                    return Err(CombError::Paging(
                        "cannot mix cached and raw updates to the same page",
                    ));
                }
                self.engine.file().write(target, buf)
            }
        }
    }

    /// Opens a page-aligned byte window over `count` logical pages.
    ///
    /// Writable modes remap the whole range onto a freshly allocated
    /// extent on first touch; `ReadWrite` seeds the extent with the
    /// snapshot's current content.
    pub fn slice(&mut self, mode: SliceMode, page: PageId, count: u32) -> Result<Slice> {
        if mode == SliceMode::Read {
            return match self.local_update(page) {
                Some(Update::Freed) => Err(CombError::Paging("read of a freed page")),
                Some(Update::Allocated) => self.engine.file().slice(mode, page, count),
                Some(Update::Remapped(target)) => self.engine.file().slice(mode, target, count),
                None => {
                    let snapshot = self.snapshot();
                    snapshot.slice(page, count)
                }
            };
        }
        match self.local_update(page) {
            None => {
                self.snapshot();
                let target = self.engine.alloc_raw(count)?;
                {
                    let updates = self.updates_mut();
                    for i in 0..count as u64 {
                        updates.insert(PageId(page.0 + i), Update::Remapped(PageId(target.0 + i)));
                    }
                }
                if mode == SliceMode::ReadWrite {
                    let source = match &self.snapshot {
                        Some(snapshot) => snapshot.slice(page, count)?,
                        None => return Err(CombError::Paging("snapshot unavailable")),
                    };
                    let copy = self.engine.file().write_extent(target, source.data());
                    self.engine.file().unslice(source)?;
                    copy?;
                }
                self.engine.file().slice(mode, target, count)
            }
            Some(Update::Freed) => Err(CombError::Paging("write of a freed page")),
            Some(Update::Allocated) => self.engine.file().slice(mode, page, count),
            Some(Update::Remapped(target)) => self.engine.file().slice(mode, target, count),
        }
    }

    /// Releases a slice, writing buffered content back for writable modes.
    pub fn unslice(&mut self, slice: Slice) -> Result<()> {
        self.engine.file().unslice(slice)
    }

    /// Hands the transaction's updates to the engine for atomic
    /// publication. On failure every page this transaction allocated is
    /// released; the snapshot is closed and local state cleared on both
    /// paths.
    pub fn commit(&mut self) -> Result<()> {
        let updates = self.updates.take();
        let deferred = self.deferred.take().unwrap_or_default();
        let snapshot = self.snapshot.take();
        let mut result = Ok(());
        if let Some(updates) = updates {
            debug!(
                updates = updates.len(),
                deferred = deferred.len(),
                "committing transaction"
            );
            if let Err(err) = self
                .engine
                .commit(snapshot.as_deref(), &updates, &deferred)
            {
                self.free_update_pages(&updates);
                result = Err(err);
            }
        }
        if let Some(snapshot) = snapshot {
            let closed = self.engine.close_snapshot(&snapshot);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }

    /// Discards the transaction, returning every locally allocated page to
    /// the engine allocator.
    pub fn rollback(&mut self) -> Result<()> {
        let updates = self.updates.take();
        self.deferred = None;
        let snapshot = self.snapshot.take();
        if let Some(updates) = updates {
            self.free_update_pages(&updates);
            self.engine.metrics().record_rollback();
        }
        if let Some(snapshot) = snapshot {
            self.engine.close_snapshot(&snapshot)?;
        }
        Ok(())
    }

    /// Returns transaction-allocated pages to the engine allocator.
    /// `Freed` entries reference durable pages whose release happens only
    /// at commit, so they are skipped.
    fn free_update_pages(&self, updates: &HashMap<PageId, Update>) {
        for (page, update) in updates {
            let owned = match update {
                Update::Freed => continue,
                Update::Allocated => *page,
                Update::Remapped(target) => *target,
            };
            if let Err(err) = self.engine.free_raw(owned, 1) {
                warn!(page = owned.0, error = %err, "failed to release page on rollback");
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.updates.is_some() || self.snapshot.is_some() {
            if let Err(err) = self.rollback() {
                warn!(error = %err, "implicit rollback failed");
            }
        }
    }
}

/// Allocator view scoped to one transaction: fresh pages are recorded as
/// `Allocated`, frees as `Freed`, and pages obtained by this transaction
/// go straight back to the engine allocator.
pub struct TxAllocator<'a> {
    tx: &'a mut Transaction,
}

impl Allocator for TxAllocator<'_> {
    fn alloc(&mut self, count: u32) -> Result<PageId> {
        let first = self.tx.engine.alloc_raw(count)?;
        let updates = self.tx.updates_mut();
        for i in 0..count as u64 {
            updates.insert(PageId(first.0 + i), Update::Allocated);
        }
        Ok(first)
    }

    fn free(&mut self, page: PageId, count: u32) -> Result<()> {
        for i in 0..count as u64 {
            let key = PageId(page.0 + i);
            match self.tx.updates_mut().insert(key, Update::Freed) {
                None => {
                    if !self.tx.engine.allocator_is_allocated(key) {
                        self.tx.updates_mut().remove(&key);
                        return Err(CombError::Paging("free of a page that is already free"));
                    }
                }
                Some(Update::Allocated) => {
                    // Allocated in this transaction: never part of the
                    // durable update stream, release it right away.
                    self.tx.updates_mut().remove(&key);
                    self.tx.engine.free_raw(key, 1)?;
                }
                Some(Update::Remapped(target)) => {
                    if let Some(deferred) = self.tx.deferred.as_mut() {
                        deferred.remove(&key);
                    }
                    self.tx.engine.free_raw(target, 1)?;
                }
                Some(Update::Freed) => {
                    return Err(CombError::Paging("free of a page that is already free"));
                }
            }
        }
        Ok(())
    }

    fn unfree(&mut self, _page: PageId, _count: u32) -> Result<()> {
        Err(CombError::Unsupported("unfree within a transaction"))
    }

    fn clear(&mut self) -> Result<()> {
        Err(CombError::Unsupported("clear within a transaction"))
    }

    fn limit(&self) -> u64 {
        self.tx.engine.allocator_limit()
    }

    fn is_allocated(&self, page: PageId) -> bool {
        self.tx.engine.allocator_is_allocated(page)
    }
}
