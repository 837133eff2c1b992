use crate::error::{CombError, Result};
use crate::paged::tx::Transaction;
use crate::paged::{Allocator, PageId};

/// Byte codec for typed objects stored in pages.
///
/// Codecs are pure with respect to a transaction: encoding and decoding
/// touch bytes only, and `remove` schedules page frees exclusively through
/// the transaction it is handed. Commit atomicity stays the transaction's
/// concern.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;

    /// Removes a stored value, freeing every page it owns. The default
    /// covers values occupying a single page.
    fn remove(&self, tx: &mut Transaction, page: PageId) -> Result<()> {
        tx.allocator().free(page, 1)
    }
}

/// Length of the `[u32 len]` prefix framing every stored object.
pub(crate) const OBJECT_FRAME_HDR: usize = 4;

/// Frames encoded bytes for storage.
pub(crate) fn frame_object(bytes: Vec<u8>) -> Result<Vec<u8>> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CombError::Invalid("encoded object exceeds frame capacity"))?;
    let mut framed = Vec::with_capacity(OBJECT_FRAME_HDR + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

/// Reads the framed payload length from the first bytes of a stored object.
pub(crate) fn framed_len(buf: &[u8]) -> Result<usize> {
    if buf.len() < OBJECT_FRAME_HDR {
        return Err(CombError::Corruption("object frame truncated"));
    }
    let len = u32::from_be_bytes(buf[..OBJECT_FRAME_HDR].try_into().unwrap()) as usize;
    Ok(len)
}

/// Extracts the framed payload from a buffer holding the full frame.
pub(crate) fn unframe(buf: &[u8]) -> Result<&[u8]> {
    let len = framed_len(buf)?;
    buf.get(OBJECT_FRAME_HDR..OBJECT_FRAME_HDR + len)
        .ok_or(CombError::Corruption("object frame truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let framed = frame_object(b"payload".to_vec()).unwrap();
        assert_eq!(framed_len(&framed).unwrap(), 7);
        assert_eq!(unframe(&framed).unwrap(), b"payload");
    }

    #[test]
    fn truncated_frame_is_corruption() {
        assert!(matches!(
            framed_len(&[0u8; 2]),
            Err(CombError::Corruption(_))
        ));
        let mut framed = frame_object(b"payload".to_vec()).unwrap();
        framed.truncate(6);
        assert!(matches!(unframe(&framed), Err(CombError::Corruption(_))));
    }
}
