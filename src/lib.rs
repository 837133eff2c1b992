pub mod config;
pub mod error;
pub mod metrics;
pub mod paged;
pub mod store;

pub use crate::config::StoreConfig;
pub use crate::error::{CombError, Result};
pub use crate::metrics::MetricsSnapshot;
pub use crate::paged::{
    Allocator, Codec, PageId, PagedOptions, Slice, SliceMode, Snapshot, Transaction, TxPageFile,
};
pub use crate::store::{
    MessageKey, MessageRecord, MessageStore, QueueEntryRange, QueueEntryRecord, QueueKey,
    QueueRecord, QueueStatus, StoreUow, UowId, UowPhase, UowResult,
};
