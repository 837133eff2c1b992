//! Multi-page object storage over the raw transaction API.
//!
//! Objects larger than a page cannot go through the deferred-update path;
//! they are written copy-on-write into a fresh contiguous extent and
//! referenced by their first page. Loads go through the snapshot object
//! cache, which understands the same frame layout.

use crate::error::Result;
use crate::paged::codec::{self, Codec};
use crate::paged::file::SliceMode;
use crate::paged::tx::Transaction;
use crate::paged::{Allocator, PageId};

/// Writes a framed object into a freshly allocated extent, returning its
/// first page. The previous incarnation, if any, must be freed separately
/// with [`free_blob`].
pub fn write_blob<T, C>(tx: &mut Transaction, codec: &C, value: &T) -> Result<PageId>
where
    C: Codec<T>,
{
    let framed = codec::frame_object(codec.encode(value)?)?;
    let count = tx.pages(framed.len()).max(1);
    let first = tx.allocator().alloc(count)?;
    let mut slice = tx.slice(SliceMode::Write, first, count)?;
    slice.data_mut()[..framed.len()].copy_from_slice(&framed);
    tx.unslice(slice)?;
    Ok(first)
}

/// Frees the extent occupied by a previously committed blob.
pub fn free_blob(tx: &mut Transaction, page: PageId) -> Result<()> {
    let mut header = [0u8; codec::OBJECT_FRAME_HDR];
    tx.read(page, &mut header)?;
    let len = codec::framed_len(&header)?;
    let count = tx.pages(codec::OBJECT_FRAME_HDR + len).max(1);
    tx.allocator().free(page, count)
}
