use std::path::PathBuf;

/// Configuration for a [`MessageStore`](crate::store::MessageStore).
///
/// `flush_delay_ms` bounds how long a delayable unit of work may sit in the
/// pipeline before it is forced to disk. Larger values give enqueue/dequeue
/// cancellation more opportunity to elide work at the cost of commit
/// latency; a negative value disables delaying entirely.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the backing file. Required.
    pub directory: PathBuf,
    /// Upper bound in milliseconds a delayable UOW may wait before flushing.
    pub flush_delay_ms: i64,
    /// Size of each page in bytes. Fixed for the lifetime of a database.
    pub page_size: u32,
    /// Capacity of the page allocator, in pages.
    pub max_pages: u64,
    /// Whether commits fsync the backing file before publishing.
    pub sync_writes: bool,
}

impl StoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            flush_delay_ms: 100,
            page_size: 4096,
            max_pages: 1 << 20,
            sync_writes: true,
        }
    }

    /// Flush every UOW as soon as it is submitted.
    pub fn no_delay(mut self) -> Self {
        self.flush_delay_ms = -1;
        self
    }

    /// Trade durability for throughput: skip fsync on commit.
    pub fn unsynced(mut self) -> Self {
        self.sync_writes = false;
        self
    }

    pub fn with_flush_delay_ms(mut self, delay: i64) -> Self {
        self.flush_delay_ms = delay;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }
}
