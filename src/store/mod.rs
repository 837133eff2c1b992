//! The broker-facing message store: a paged engine underneath, an
//! asynchronous unit-of-work pipeline in front.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::{CombError, Result};
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::paged::meta::DATA_START;
use crate::paged::{blob, PagedOptions, Transaction, TxPageFile};

mod flush;
mod pipeline;
mod records;
mod uow;

pub use records::{
    MessageKey, MessageRecord, QueueEntryRange, QueueEntryRecord, QueueKey, QueueRecord,
    QueueStatus,
};
pub use uow::{StoreUow, UowId, UowPhase, UowResult};

use flush::WorkerJob;
use pipeline::PipelineEvent;
use records::{
    MessageIndexCodec, QueueCatalog, QueueCatalogCodec, QueueEntries, QueueEntriesCodec,
    RootCodec, RootRecord,
};

/// The store root object lives at the first data page.
pub(crate) const ROOT_PAGE: crate::paged::PageId = DATA_START;

const STORE_FILE: &str = "store.db";

/// Durable message store for a broker.
///
/// Writes flow through units of work: the pipeline coordinator batches
/// and cancels them, and a single flush worker persists surviving batches
/// through the paged engine. Reads run read-only transactions on the
/// caller's thread.
pub struct MessageStore {
    engine: Arc<TxPageFile>,
    metrics: Arc<StoreMetrics>,
    events: Sender<PipelineEvent>,
    jobs: Sender<WorkerJob>,
    coordinator: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    next_message_key: Arc<AtomicU64>,
    next_uow_id: AtomicU64,
}

impl MessageStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;
        let metrics = Arc::new(StoreMetrics::default());
        let options = PagedOptions {
            page_size: config.page_size,
            max_pages: config.max_pages,
            sync_writes: config.sync_writes,
        };
        let engine = TxPageFile::open(
            config.directory.join(STORE_FILE),
            &options,
            Arc::clone(&metrics),
        )?;

        let (event_tx, event_rx) = mpsc::channel();
        let (job_tx, job_rx) = mpsc::channel();
        let worker = flush::spawn(Arc::clone(&engine), job_rx, event_tx.clone());
        let coordinator = pipeline::spawn(
            event_rx,
            job_tx.clone(),
            config.flush_delay_ms,
            Arc::clone(&metrics),
        );

        let store = Self {
            engine,
            metrics,
            events: event_tx,
            jobs: job_tx,
            coordinator: Some(coordinator),
            worker: Some(worker),
            next_message_key: Arc::new(AtomicU64::new(0)),
            next_uow_id: AtomicU64::new(0),
        };
        store.exec(flush::initialize)?;
        let root = store.with_read(|tx| Ok((*tx.get(&RootCodec, ROOT_PAGE)?).clone()))?;
        store
            .next_message_key
            .store(root.last_message_key, Ordering::SeqCst);
        info!(
            directory = %config.directory.display(),
            flush_delay_ms = config.flush_delay_ms,
            last_message_key = root.last_message_key,
            last_queue_key = root.last_queue_key,
            "message store opened"
        );
        Ok(store)
    }

    /// Starts a new unit of work. Dropping the handle submits it.
    pub fn create_uow(&self) -> StoreUow {
        let id = self.next_uow_id.fetch_add(1, Ordering::SeqCst) + 1;
        StoreUow::new(id, self.events.clone(), Arc::clone(&self.next_message_key))
    }

    /// Registers a queue, assigning it the next queue key.
    pub fn add_queue(&self, record: QueueRecord) -> Result<QueueKey> {
        self.exec(move |engine| {
            let mut tx = engine.tx();
            let result = (|| -> Result<QueueKey> {
                let mut root = (*tx.get(&RootCodec, ROOT_PAGE)?).clone();
                let mut catalog = load_catalog(&mut tx, &root)?;
                root.last_queue_key += 1;
                let key = QueueKey(root.last_queue_key);
                catalog.insert(
                    key,
                    records::QueueInfo {
                        record,
                        entries: None,
                    },
                );
                store_catalog(&mut tx, &mut root, catalog)?;
                tx.put(&RootCodec, ROOT_PAGE, root)?;
                Ok(key)
            })();
            finish_tx(tx, result)
        })
    }

    /// Drops a queue and its entries. Messages left without queue
    /// references leave the index with the queue.
    pub fn remove_queue(&self, key: QueueKey) -> Result<bool> {
        self.exec(move |engine| {
            let mut tx = engine.tx();
            let result = (|| -> Result<bool> {
                let mut root = (*tx.get(&RootCodec, ROOT_PAGE)?).clone();
                let mut catalog = load_catalog(&mut tx, &root)?;
                let Some(info) = catalog.remove(&key) else {
                    return Ok(false);
                };
                let mut index = match root.message_index {
                    Some(page) => (*tx.get(&MessageIndexCodec, page)?).clone(),
                    None => records::MessageIndex::new(),
                };
                let mut index_dirty = false;
                if let Some(entries_page) = info.entries {
                    let entries = (*tx.get(&QueueEntriesCodec, entries_page)?).clone();
                    for entry in entries.values() {
                        if let Some(message) = index.get_mut(&entry.message_key) {
                            message.refs = message.refs.saturating_sub(1);
                            if message.refs == 0 {
                                index.remove(&entry.message_key);
                            }
                            index_dirty = true;
                        }
                    }
                    blob::free_blob(&mut tx, entries_page)?;
                }
                if index_dirty {
                    if let Some(old) = root.message_index.take() {
                        blob::free_blob(&mut tx, old)?;
                    }
                    if !index.is_empty() {
                        root.message_index =
                            Some(blob::write_blob(&mut tx, &MessageIndexCodec, &index)?);
                    }
                }
                store_catalog(&mut tx, &mut root, catalog)?;
                tx.put(&RootCodec, ROOT_PAGE, root)?;
                Ok(true)
            })();
            finish_tx(tx, result)
        })
    }

    pub fn list_queues(&self) -> Result<Vec<(QueueKey, QueueRecord)>> {
        self.with_read(|tx| {
            let root = tx.get(&RootCodec, ROOT_PAGE)?;
            let catalog = load_catalog(tx, &root)?;
            Ok(catalog
                .into_iter()
                .map(|(key, info)| (key, info.record))
                .collect())
        })
    }

    pub fn get_queue_status(&self, key: QueueKey) -> Result<Option<QueueStatus>> {
        self.with_read(|tx| {
            let root = tx.get(&RootCodec, ROOT_PAGE)?;
            let catalog = load_catalog(tx, &root)?;
            let Some(info) = catalog.get(&key) else {
                return Ok(None);
            };
            let entries = load_queue_entries(tx, info)?;
            Ok(Some(QueueStatus {
                key,
                record: info.record.clone(),
                count: entries.len() as u64,
                first_seq: entries.keys().next().copied(),
                last_seq: entries.keys().next_back().copied(),
            }))
        })
    }

    /// Contiguous-run summaries of a queue's entries, at most `limit`
    /// entries per range.
    pub fn list_queue_entry_ranges(
        &self,
        key: QueueKey,
        limit: usize,
    ) -> Result<Vec<QueueEntryRange>> {
        if limit == 0 {
            return Err(CombError::Invalid("range limit must be positive"));
        }
        self.with_read(|tx| {
            let root = tx.get(&RootCodec, ROOT_PAGE)?;
            let catalog = load_catalog(tx, &root)?;
            let Some(info) = catalog.get(&key) else {
                return Ok(Vec::new());
            };
            let entries = load_queue_entries(tx, info)?;
            let seqs: Vec<u64> = entries.keys().copied().collect();
            Ok(seqs
                .chunks(limit)
                .map(|chunk| QueueEntryRange {
                    first_seq: chunk[0],
                    last_seq: chunk[chunk.len() - 1],
                    count: chunk.len() as u64,
                })
                .collect())
        })
    }

    pub fn list_queue_entries(
        &self,
        key: QueueKey,
        first_seq: u64,
        last_seq: u64,
    ) -> Result<Vec<QueueEntryRecord>> {
        self.with_read(|tx| {
            let root = tx.get(&RootCodec, ROOT_PAGE)?;
            let catalog = load_catalog(tx, &root)?;
            let Some(info) = catalog.get(&key) else {
                return Ok(Vec::new());
            };
            let entries = load_queue_entries(tx, info)?;
            Ok(entries
                .range(first_seq..=last_seq)
                .map(|(_, entry)| *entry)
                .collect())
        })
    }

    /// Loads a message, seeing unflushed pipeline state before disk.
    pub fn load_message(&self, key: MessageKey) -> Result<Option<MessageRecord>> {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self
            .events
            .send(PipelineEvent::LoadMessage(key, reply_tx))
            .is_ok()
        {
            if let Ok(Some(record)) = reply_rx.recv() {
                return Ok(Some(record));
            }
        }
        self.with_read(|tx| {
            let root = tx.get(&RootCodec, ROOT_PAGE)?;
            let Some(page) = root.message_index else {
                return Ok(None);
            };
            let index = tx.get(&MessageIndexCodec, page)?;
            Ok(index.get(&key).map(|message| message.record.clone()))
        })
    }

    /// Invokes `listener` once the message is durable; if it sits in an
    /// unflushed UOW, that UOW is flushed without waiting out its delay.
    pub fn flush_message(
        &self,
        key: MessageKey,
        listener: impl FnOnce(UowResult) + Send + 'static,
    ) -> Result<()> {
        self.events
            .send(PipelineEvent::FlushMessage(key, Box::new(listener)))
            .map_err(|_| CombError::Invalid("store is closed"))
    }

    /// Removes every queue and message, keeping the key counters.
    pub fn purge(&self) -> Result<()> {
        self.exec(move |engine| {
            let mut tx = engine.tx();
            let result = (|| -> Result<()> {
                let mut root = (*tx.get(&RootCodec, ROOT_PAGE)?).clone();
                let catalog = load_catalog(&mut tx, &root)?;
                for info in catalog.values() {
                    if let Some(page) = info.entries {
                        blob::free_blob(&mut tx, page)?;
                    }
                }
                if let Some(page) = root.queue_catalog.take() {
                    blob::free_blob(&mut tx, page)?;
                }
                if let Some(page) = root.message_index.take() {
                    blob::free_blob(&mut tx, page)?;
                }
                tx.put(&RootCodec, ROOT_PAGE, root)?;
                Ok(())
            })();
            finish_tx(tx, result)
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Syncs the backing file.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// Drains the pipeline, stops both background threads, and syncs.
    pub fn close(&mut self) -> Result<()> {
        if self.coordinator.is_none() && self.worker.is_none() {
            return Ok(());
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.events.send(PipelineEvent::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
        let _ = self.jobs.send(WorkerJob::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        info!("message store closed");
        self.engine.flush()
    }

    /// Runs a write operation on the flush worker, the engine's only
    /// writer, and waits for its result.
    fn exec<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Arc<TxPageFile>) -> Result<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.jobs
            .send(WorkerJob::Exec(Box::new(move |engine| {
                let _ = reply_tx.send(job(engine));
            })))
            .map_err(|_| CombError::Invalid("store is closed"))?;
        reply_rx
            .recv()
            .map_err(|_| CombError::Invalid("store is closed"))?
    }

    fn with_read<R>(&self, f: impl FnOnce(&mut Transaction) -> Result<R>) -> Result<R> {
        let mut tx = self.engine.tx();
        let result = f(&mut tx);
        let closed = tx.rollback();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "error while closing message store");
        }
    }
}

fn load_catalog(tx: &mut Transaction, root: &RootRecord) -> Result<QueueCatalog> {
    Ok(match root.queue_catalog {
        Some(page) => (*tx.get(&QueueCatalogCodec, page)?).clone(),
        None => QueueCatalog::new(),
    })
}

fn load_queue_entries(tx: &mut Transaction, info: &records::QueueInfo) -> Result<QueueEntries> {
    Ok(match info.entries {
        Some(page) => (*tx.get(&QueueEntriesCodec, page)?).clone(),
        None => QueueEntries::new(),
    })
}

fn store_catalog(
    tx: &mut Transaction,
    root: &mut RootRecord,
    catalog: QueueCatalog,
) -> Result<()> {
    if let Some(old) = root.queue_catalog.take() {
        blob::free_blob(tx, old)?;
    }
    if !catalog.is_empty() {
        root.queue_catalog = Some(blob::write_blob(tx, &QueueCatalogCodec, &catalog)?);
    }
    Ok(())
}

fn finish_tx<R>(mut tx: Transaction, result: Result<R>) -> Result<R> {
    match result {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            let _ = tx.rollback();
            Err(err)
        }
    }
}
