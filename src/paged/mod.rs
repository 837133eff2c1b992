//! The paged transaction engine: copy-on-write pages, snapshot isolation,
//! and deferred typed updates.

use std::fmt;

pub mod allocator;
pub mod blob;
pub mod codec;
pub mod engine;
pub mod file;
pub mod io;
pub mod meta;
pub mod snapshot;
pub mod tx;

pub use allocator::{Allocator, Extent, ExtentAllocator};
pub use codec::Codec;
pub use engine::{PagedOptions, TxPageFile};
pub use file::{PageFile, Slice, SliceMode};
pub use snapshot::{Redirect, Snapshot};
pub use tx::{Transaction, TxAllocator, Update};

/// Identifier of a fixed-size page in the backing file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
