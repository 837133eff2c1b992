use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::error::{CombError, Result};
use crate::metrics::StoreMetrics;
use crate::paged::allocator::{Allocator, Extent, ExtentAllocator};
use crate::paged::codec;
use crate::paged::file::PageFile;
use crate::paged::meta::{
    self, load_meta, write_meta_slot, Meta, TableRoot, DATA_START, META_FORMAT_VERSION,
};
use crate::paged::snapshot::{PageTable, Redirect, Snapshot};
use crate::paged::tx::{DeferredUpdate, Transaction, Update};
use crate::paged::PageId;

/// Engine-level tuning for a paged file.
#[derive(Clone, Debug)]
pub struct PagedOptions {
    pub page_size: u32,
    pub max_pages: u64,
    pub sync_writes: bool,
}

impl Default for PagedOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_pages: 1 << 20,
            sync_writes: true,
        }
    }
}

struct ReclaimEntry {
    version: u64,
    pages: Vec<PageId>,
}

struct EngineState {
    meta: Meta,
    current: Arc<Snapshot>,
    open_refs: BTreeMap<u64, usize>,
    pending_reclaim: Vec<ReclaimEntry>,
}

/// Copy-on-write paged file with snapshot isolation.
///
/// Writers stage changes in [`Transaction`]s; `commit` publishes a new
/// snapshot atomically and schedules superseded physical pages for
/// reclamation once every snapshot that can observe them has closed.
/// The engine assumes a single writer at a time; readers are unrestricted.
pub struct TxPageFile {
    file: PageFile,
    allocator: Mutex<ExtentAllocator>,
    state: Mutex<EngineState>,
    sync_writes: bool,
    metrics: Arc<StoreMetrics>,
}

impl TxPageFile {
    pub fn open(
        path: impl AsRef<Path>,
        options: &PagedOptions,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Arc<Self>> {
        let file = PageFile::open(path, options.page_size)?;
        let (meta_rec, allocator, redirects) = if file.is_empty()? {
            let mut rng = OsRng;
            let meta_rec = Meta {
                page_size: options.page_size,
                salt: rng.next_u64(),
                format_version: META_FORMAT_VERSION,
                commit_version: 0,
                free_root: TableRoot::NONE,
                redirect_root: TableRoot::NONE,
            };
            write_meta_slot(&file, &meta_rec)?;
            file.sync()?;
            info!(
                page_size = options.page_size,
                max_pages = options.max_pages,
                "initialized paged file"
            );
            (
                meta_rec,
                ExtentAllocator::new(DATA_START.0, options.max_pages),
                HashMap::new(),
            )
        } else {
            let meta_rec = load_meta(&file)?;
            if meta_rec.page_size != options.page_size {
                return Err(CombError::Invalid(
                    "page size differs from the stored database",
                ));
            }
            let allocator = if meta_rec.free_root.is_none() {
                ExtentAllocator::new(DATA_START.0, options.max_pages)
            } else {
                let bytes = read_table(&file, meta_rec.free_root)?;
                let extents = meta::decode_free_table(&bytes, meta_rec.salt)?;
                ExtentAllocator::from_free_extents(DATA_START.0, options.max_pages, extents)?
            };
            let redirects = if meta_rec.redirect_root.is_none() {
                HashMap::new()
            } else {
                let bytes = read_table(&file, meta_rec.redirect_root)?;
                meta::decode_redirect_table(&bytes, meta_rec.salt)?
            };
            debug!(
                commit_version = meta_rec.commit_version,
                redirects = redirects.len(),
                "opened paged file"
            );
            (meta_rec, allocator, redirects)
        };
        let table = Arc::new(PageTable::new(meta_rec.commit_version, redirects));
        let current = Arc::new(Snapshot::new(table, file.clone()));
        Ok(Arc::new(Self {
            file,
            allocator: Mutex::new(allocator),
            state: Mutex::new(EngineState {
                meta: meta_rec,
                current,
                open_refs: BTreeMap::new(),
                pending_reclaim: Vec::new(),
            }),
            sync_writes: options.sync_writes,
            metrics,
        }))
    }

    /// Starts a new transaction against this engine.
    pub fn tx(self: &Arc<Self>) -> Transaction {
        Transaction::new(Arc::clone(self))
    }

    pub(crate) fn file(&self) -> &PageFile {
        &self.file
    }

    pub fn page_size(&self) -> u32 {
        self.file.page_size()
    }

    pub fn pages(&self, byte_len: usize) -> u32 {
        self.file.pages(byte_len)
    }

    pub fn commit_version(&self) -> u64 {
        self.state.lock().meta.commit_version
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn flush(&self) -> Result<()> {
        self.file.sync()
    }

    pub(crate) fn alloc_raw(&self, count: u32) -> Result<PageId> {
        self.allocator.lock().alloc(count)
    }

    pub(crate) fn free_raw(&self, page: PageId, count: u32) -> Result<()> {
        self.allocator.lock().free(page, count)
    }

    pub(crate) fn allocator_limit(&self) -> u64 {
        self.allocator.lock().limit()
    }

    pub(crate) fn allocator_is_allocated(&self, page: PageId) -> bool {
        self.allocator.lock().is_allocated(page)
    }

    /// Pages currently free in the engine allocator. Deferred-reclaim pages
    /// count as allocated until their snapshots quiesce.
    pub fn free_page_count(&self) -> u64 {
        self.allocator.lock().free_page_count()
    }

    /// Hands out the current published snapshot, incrementing its
    /// reference count. Callers must pair this with `close_snapshot`.
    pub fn open_snapshot(&self) -> Arc<Snapshot> {
        let mut state = self.state.lock();
        let version = state.current.version();
        *state.open_refs.entry(version).or_insert(0) += 1;
        Arc::clone(&state.current)
    }

    /// Drops one reference to a snapshot; reaching zero may release pages
    /// superseded while it was live.
    pub fn close_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut state = self.state.lock();
        let version = snapshot.version();
        match state.open_refs.get_mut(&version) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return Ok(());
            }
            Some(_) => {
                state.open_refs.remove(&version);
            }
            None => {
                warn!(version, "close of a snapshot that is not open");
                return Ok(());
            }
        }
        let mut allocator = self.allocator.lock();
        Self::reclaim_quiesced(&mut state, &mut allocator, &self.metrics)
    }

    /// Applies a transaction's updates atomically.
    ///
    /// Ordering: deferred updates are encoded into their reserved pages,
    /// the free and redirect tables and the meta record are persisted, and
    /// only then is the new snapshot published. Any failure before
    /// publication leaves the engine in the pre-commit state; the caller
    /// rolls back its own allocations.
    pub(crate) fn commit(
        &self,
        snapshot: Option<&Snapshot>,
        updates: &HashMap<PageId, Update>,
        deferred: &HashMap<PageId, DeferredUpdate>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        debug_assert!(snapshot.is_none_or(|s| s.version() <= state.current.version()));
        let page_size = self.file.page_size() as usize;

        for update in deferred.values() {
            let framed = update.encode_framed()?;
            if framed.len() > page_size {
                return Err(CombError::Paging("encoded object exceeds a page"));
            }
            self.file.write(update.target(), &framed)?;
        }

        let old_table = Arc::clone(state.current.table());
        let mut redirects = old_table.redirects().clone();
        let mut reclaim: Vec<PageId> = Vec::new();
        for (page, update) in updates {
            match update {
                Update::Allocated => {
                    redirects.remove(page);
                }
                Update::Remapped(target) => {
                    let old = old_table.resolve_lenient(*page);
                    if old != *target {
                        reclaim.push(old);
                    }
                    redirects.insert(*page, Redirect::To(*target));
                }
                Update::Freed => {
                    let old = old_table.resolve_lenient(*page);
                    if old != *page {
                        reclaim.push(old);
                    }
                    reclaim.push(*page);
                    redirects.insert(*page, Redirect::Freed);
                }
            }
        }
        let version = state.meta.commit_version + 1;

        // The tables written by the previous commit are superseded here.
        for root in [state.meta.free_root, state.meta.redirect_root] {
            for i in 0..root.pages as u64 {
                reclaim.push(PageId(root.page.0 + i));
            }
        }

        let mut allocator = self.allocator.lock();
        let (free_root, redirect_root) = self.persist_tables(
            &mut allocator,
            &state.pending_reclaim,
            &reclaim,
            &redirects,
            state.meta.salt,
        )?;
        let new_meta = Meta {
            commit_version: version,
            free_root,
            redirect_root,
            ..state.meta
        };
        let persisted = write_meta_slot(&self.file, &new_meta).and_then(|()| {
            if self.sync_writes {
                self.file.sync()
            } else {
                Ok(())
            }
        });
        if let Err(err) = persisted {
            let _ = allocator.free(free_root.page, free_root.pages);
            let _ = allocator.free(redirect_root.page, redirect_root.pages);
            return Err(err);
        }

        state.meta = new_meta;
        let table = Arc::new(PageTable::new(version, redirects));
        state.current = Arc::new(Snapshot::new(table, self.file.clone()));
        if !reclaim.is_empty() {
            state.pending_reclaim.push(ReclaimEntry {
                version,
                pages: reclaim,
            });
        }
        Self::reclaim_quiesced(&mut state, &mut allocator, &self.metrics)?;
        self.metrics.record_commit();
        debug!(version, updates = updates.len(), "commit published");
        Ok(())
    }

    /// Writes the redirect and free tables into freshly allocated pages.
    ///
    /// The free table describes the allocator state with both tables
    /// placed and every deferred-reclaim page folded back in (after a
    /// crash no snapshot is live, so those pages are free). Sizing the
    /// free table changes the state it describes, so allocation retries
    /// until the encoding fits.
    fn persist_tables(
        &self,
        allocator: &mut ExtentAllocator,
        pending: &[ReclaimEntry],
        reclaim: &[PageId],
        redirects: &HashMap<PageId, Redirect>,
        salt: u64,
    ) -> Result<(TableRoot, TableRoot)> {
        let redirect_bytes = codec::frame_object(meta::encode_redirect_table(redirects, salt))?;
        let redirect_pages = self.file.pages(redirect_bytes.len());
        let redirect_page = allocator.alloc(redirect_pages)?;

        let mut guess = {
            let projected = projected_free_extents(allocator, pending, reclaim);
            let bytes = meta::encode_free_table(&projected, salt);
            self.file.pages(codec::OBJECT_FRAME_HDR + bytes.len())
        };
        for _ in 0..8 {
            let free_page = match allocator.alloc(guess) {
                Ok(page) => page,
                Err(err) => {
                    let _ = allocator.free(redirect_page, redirect_pages);
                    return Err(err);
                }
            };
            let projected = projected_free_extents(allocator, pending, reclaim);
            let free_bytes = codec::frame_object(meta::encode_free_table(&projected, salt))?;
            let needed = self.file.pages(free_bytes.len());
            if needed <= guess {
                let written = self
                    .file
                    .write_extent(redirect_page, &redirect_bytes)
                    .and_then(|()| self.file.write_extent(free_page, &free_bytes));
                if let Err(err) = written {
                    let _ = allocator.free(free_page, guess);
                    let _ = allocator.free(redirect_page, redirect_pages);
                    return Err(err);
                }
                return Ok((
                    TableRoot {
                        page: free_page,
                        pages: guess,
                    },
                    TableRoot {
                        page: redirect_page,
                        pages: redirect_pages,
                    },
                ));
            }
            allocator.free(free_page, guess)?;
            guess = needed;
        }
        let _ = allocator.free(redirect_page, redirect_pages);
        Err(CombError::Invalid("free table sizing failed to stabilize"))
    }

    /// Frees pending-reclaim pages whose superseding commit is no longer
    /// observable by any open snapshot.
    fn reclaim_quiesced(
        state: &mut EngineState,
        allocator: &mut ExtentAllocator,
        metrics: &StoreMetrics,
    ) -> Result<()> {
        let min_open = state.open_refs.keys().next().copied();
        let mut kept = Vec::new();
        let mut freeable = Vec::new();
        for entry in state.pending_reclaim.drain(..) {
            if min_open.is_none_or(|m| entry.version <= m) {
                freeable.push(entry);
            } else {
                kept.push(entry);
            }
        }
        state.pending_reclaim = kept;
        let mut freed = 0u64;
        for entry in &freeable {
            for page in &entry.pages {
                allocator.free(*page, 1)?;
                freed += 1;
            }
        }
        if freed > 0 {
            metrics.record_pages_reclaimed(freed);
            debug!(pages = freed, "reclaimed superseded pages");
        }
        Ok(())
    }
}

fn read_table(file: &PageFile, root: TableRoot) -> Result<Vec<u8>> {
    let bytes = file.read_extent(root.page, root.pages)?;
    Ok(codec::unframe(&bytes)?.to_vec())
}

fn projected_free_extents(
    allocator: &ExtentAllocator,
    pending: &[ReclaimEntry],
    reclaim: &[PageId],
) -> Vec<Extent> {
    let mut extents = allocator.free_extents().to_vec();
    for entry in pending {
        extents.extend(entry.pages.iter().map(|p| Extent::new(p.0, 1)));
    }
    extents.extend(reclaim.iter().map(|p| Extent::new(p.0, 1)));
    extents.sort_by_key(|e| e.start);
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        if let Some(last) = merged.last_mut() {
            if last.start + last.len == extent.start {
                last.len += extent.len;
                continue;
            }
        }
        merged.push(extent);
    }
    merged
}
