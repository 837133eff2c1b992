use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{CombError, Result};
use crate::paged::{blob, Allocator, Transaction, TxPageFile};
use crate::store::pipeline::PipelineEvent;
use crate::store::records::{
    MessageIndex, MessageIndexCodec, QueueCatalog, QueueCatalogCodec, QueueEntries,
    QueueEntriesCodec, QueueKey, RootCodec, RootRecord, StoredMessage,
};
use crate::store::uow::Uow;
use crate::store::ROOT_PAGE;

/// Work accepted by the flush worker. The worker thread is the only
/// writer to the paged engine, so write transactions need no further
/// isolation.
pub(crate) enum WorkerJob {
    /// Persist a batch of UOWs in one transaction and report back.
    Store(Vec<Arc<Uow>>),
    /// Run an administrative operation on the worker thread.
    Exec(Box<dyn FnOnce(&Arc<TxPageFile>) + Send>),
    Shutdown,
}

pub(crate) fn spawn(
    engine: Arc<TxPageFile>,
    jobs: Receiver<WorkerJob>,
    events: Sender<PipelineEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || worker_loop(engine, jobs, events))
}

fn worker_loop(engine: Arc<TxPageFile>, jobs: Receiver<WorkerJob>, events: Sender<PipelineEvent>) {
    while let Ok(job) = jobs.recv() {
        match job {
            WorkerJob::Store(uows) => {
                let started = Instant::now();
                let error = match store_batch(&engine, &uows) {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(error = %err, "flush batch rolled back");
                        Some(Arc::new(err))
                    }
                };
                debug!(
                    uows = uows.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    failed = error.is_some(),
                    "flush batch finished"
                );
                if events
                    .send(PipelineEvent::WorkerDone { uows, error })
                    .is_err()
                {
                    break;
                }
            }
            WorkerJob::Exec(job) => job(&engine),
            WorkerJob::Shutdown => break,
        }
    }
}

fn store_batch(engine: &Arc<TxPageFile>, uows: &[Arc<Uow>]) -> Result<()> {
    let mut tx = engine.tx();
    match apply_batch(&mut tx, uows) {
        Ok(()) => tx.commit(),
        Err(err) => {
            let _ = tx.rollback();
            Err(err)
        }
    }
}

/// Serializes every UOW in the batch into one transaction: message
/// records land in the message index with their queue-reference counts,
/// enqueues and dequeues update the per-queue entry maps, and every
/// touched index is rewritten copy-on-write.
fn apply_batch(tx: &mut Transaction, uows: &[Arc<Uow>]) -> Result<()> {
    let mut root = (*tx.get(&RootCodec, ROOT_PAGE)?).clone();
    let mut index: MessageIndex = match root.message_index {
        Some(page) => (*tx.get(&MessageIndexCodec, page)?).clone(),
        None => MessageIndex::new(),
    };
    let mut index_dirty = false;
    let mut catalog: QueueCatalog = match root.queue_catalog {
        Some(page) => (*tx.get(&QueueCatalogCodec, page)?).clone(),
        None => QueueCatalog::new(),
    };
    let mut entries_cache: BTreeMap<QueueKey, (QueueEntries, bool)> = BTreeMap::new();

    for uow in uows {
        let actions = uow.state.lock().actions.clone();
        for (key, action) in actions {
            if let Some(record) = action.record {
                root.last_message_key = root.last_message_key.max(key.0);
                index.insert(key, StoredMessage { record, refs: 0 });
                index_dirty = true;
            }
            for entry in action.enqueues {
                let entries = load_entries(tx, &catalog, &mut entries_cache, entry.queue_key)?;
                entries.0.insert(entry.queue_seq, entry);
                entries.1 = true;
                if let Some(message) = index.get_mut(&entry.message_key) {
                    message.refs += 1;
                    index_dirty = true;
                }
            }
            for entry in action.dequeues {
                let entries = load_entries(tx, &catalog, &mut entries_cache, entry.queue_key)?;
                if entries.0.remove(&entry.queue_seq).is_none() {
                    continue;
                }
                entries.1 = true;
                if let Some(message) = index.get_mut(&entry.message_key) {
                    message.refs = message.refs.saturating_sub(1);
                    if message.refs == 0 {
                        index.remove(&entry.message_key);
                    }
                    index_dirty = true;
                }
            }
        }
    }

    let mut catalog_dirty = false;
    for (queue_key, (entries, dirty)) in entries_cache {
        if !dirty {
            continue;
        }
        let info = catalog
            .get_mut(&queue_key)
            .ok_or(CombError::Invalid("queue vanished during flush"))?;
        if let Some(old) = info.entries.take() {
            blob::free_blob(tx, old)?;
        }
        if !entries.is_empty() {
            info.entries = Some(blob::write_blob(tx, &QueueEntriesCodec, &entries)?);
        }
        catalog_dirty = true;
    }
    if index_dirty {
        if let Some(old) = root.message_index.take() {
            blob::free_blob(tx, old)?;
        }
        if !index.is_empty() {
            root.message_index = Some(blob::write_blob(tx, &MessageIndexCodec, &index)?);
        }
    }
    if catalog_dirty {
        if let Some(old) = root.queue_catalog.take() {
            blob::free_blob(tx, old)?;
        }
        if !catalog.is_empty() {
            root.queue_catalog = Some(blob::write_blob(tx, &QueueCatalogCodec, &catalog)?);
        }
    }
    tx.put(&RootCodec, ROOT_PAGE, root)
}

fn load_entries<'a>(
    tx: &mut Transaction,
    catalog: &QueueCatalog,
    cache: &'a mut BTreeMap<QueueKey, (QueueEntries, bool)>,
    queue: QueueKey,
) -> Result<&'a mut (QueueEntries, bool)> {
    match cache.entry(queue) {
        Entry::Occupied(occupied) => Ok(occupied.into_mut()),
        Entry::Vacant(vacant) => {
            let info = catalog
                .get(&queue)
                .ok_or(CombError::Invalid("queue is not registered"))?;
            let entries = match info.entries {
                Some(page) => (*tx.get(&QueueEntriesCodec, page)?).clone(),
                None => QueueEntries::new(),
            };
            Ok(vacant.insert((entries, false)))
        }
    }
}

/// Creates the store root object on a fresh database.
pub(crate) fn initialize(engine: &Arc<TxPageFile>) -> Result<()> {
    if engine.commit_version() > 0 {
        return Ok(());
    }
    let mut tx = engine.tx();
    let page = tx.allocator().alloc(1)?;
    debug_assert_eq!(page, ROOT_PAGE);
    tx.put(&RootCodec, page, RootRecord::default())?;
    tx.commit()
}
