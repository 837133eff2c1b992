use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CombError, Result};
use crate::paged::{Codec, PageId};

/// Key assigned by the store to every message record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageKey(pub u64);

/// Key assigned by the store to every registered queue.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct QueueKey(pub u64);

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A broker message as handed to the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageRecord {
    /// Broker-global message id.
    pub message_id: String,
    pub payload: Vec<u8>,
}

/// A registered queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueRecord {
    pub name: String,
}

/// One message's position on one queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueEntryRecord {
    pub queue_key: QueueKey,
    pub queue_seq: u64,
    pub message_key: MessageKey,
    pub size: u32,
}

/// Point-in-time description of a queue.
#[derive(Clone, Debug)]
pub struct QueueStatus {
    pub key: QueueKey,
    pub record: QueueRecord,
    pub count: u64,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
}

/// A contiguous run of queue sequence numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueEntryRange {
    pub first_seq: u64,
    pub last_seq: u64,
    pub count: u64,
}

/// The store's root object: counters plus the index roots.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RootRecord {
    pub last_message_key: u64,
    pub last_queue_key: u64,
    pub message_index: Option<PageId>,
    pub queue_catalog: Option<PageId>,
}

/// A message record at rest, with its queue-reference count. Records whose
/// count drops to zero are removed from the index.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StoredMessage {
    pub record: MessageRecord,
    pub refs: u32,
}

pub(crate) type MessageIndex = BTreeMap<MessageKey, StoredMessage>;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct QueueInfo {
    pub record: QueueRecord,
    pub entries: Option<PageId>,
}

pub(crate) type QueueCatalog = BTreeMap<QueueKey, QueueInfo>;

/// Entries of one queue, ordered by sequence number.
pub(crate) type QueueEntries = BTreeMap<u64, QueueEntryRecord>;

// Field encodings are big-endian with u32-length-prefixed byte runs.

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CombError::Invalid("byte run exceeds encoding capacity"))?;
    put_u32(out, len);
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_page(out: &mut Vec<u8>, page: Option<PageId>) {
    // Page 0 holds a meta slot and is never a data page, so it marks "none".
    put_u64(out, page.map_or(0, |p| p.0));
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CombError::Corruption("record payload truncated"))?;
        let buf = self.buf;
        let bytes = &buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| CombError::Corruption("record string not utf-8"))
    }

    fn page(&mut self) -> Result<Option<PageId>> {
        let raw = self.u64()?;
        Ok(if raw == 0 { None } else { Some(PageId(raw)) })
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CombError::Corruption("record payload has trailing bytes"))
        }
    }
}

#[derive(Clone)]
pub(crate) struct RootCodec;

impl Codec<RootRecord> for RootCodec {
    fn encode(&self, value: &RootRecord) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32);
        put_u64(&mut out, value.last_message_key);
        put_u64(&mut out, value.last_queue_key);
        put_page(&mut out, value.message_index);
        put_page(&mut out, value.queue_catalog);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RootRecord> {
        let mut reader = ByteReader::new(bytes);
        let root = RootRecord {
            last_message_key: reader.u64()?,
            last_queue_key: reader.u64()?,
            message_index: reader.page()?,
            queue_catalog: reader.page()?,
        };
        reader.finish()?;
        Ok(root)
    }
}

fn encode_message(out: &mut Vec<u8>, message: &StoredMessage) -> Result<()> {
    put_u32(out, message.refs);
    put_bytes(out, message.record.message_id.as_bytes())?;
    put_bytes(out, &message.record.payload)
}

fn decode_message(reader: &mut ByteReader<'_>) -> Result<StoredMessage> {
    Ok(StoredMessage {
        refs: reader.u32()?,
        record: MessageRecord {
            message_id: reader.string()?,
            payload: reader.bytes()?.to_vec(),
        },
    })
}

#[derive(Clone)]
pub(crate) struct MessageIndexCodec;

impl Codec<MessageIndex> for MessageIndexCodec {
    fn encode(&self, value: &MessageIndex) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_u32(&mut out, value.len() as u32);
        for (key, message) in value {
            put_u64(&mut out, key.0);
            encode_message(&mut out, message)?;
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<MessageIndex> {
        let mut reader = ByteReader::new(bytes);
        let count = reader.u32()?;
        let mut index = MessageIndex::new();
        for _ in 0..count {
            let key = MessageKey(reader.u64()?);
            index.insert(key, decode_message(&mut reader)?);
        }
        reader.finish()?;
        Ok(index)
    }
}

#[derive(Clone)]
pub(crate) struct QueueCatalogCodec;

impl Codec<QueueCatalog> for QueueCatalogCodec {
    fn encode(&self, value: &QueueCatalog) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_u32(&mut out, value.len() as u32);
        for (key, info) in value {
            put_u64(&mut out, key.0);
            put_page(&mut out, info.entries);
            put_bytes(&mut out, info.record.name.as_bytes())?;
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<QueueCatalog> {
        let mut reader = ByteReader::new(bytes);
        let count = reader.u32()?;
        let mut catalog = QueueCatalog::new();
        for _ in 0..count {
            let key = QueueKey(reader.u64()?);
            let entries = reader.page()?;
            let name = reader.string()?;
            catalog.insert(
                key,
                QueueInfo {
                    record: QueueRecord { name },
                    entries,
                },
            );
        }
        reader.finish()?;
        Ok(catalog)
    }
}

fn encode_entry(out: &mut Vec<u8>, entry: &QueueEntryRecord) {
    put_u64(out, entry.queue_key.0);
    put_u64(out, entry.queue_seq);
    put_u64(out, entry.message_key.0);
    put_u32(out, entry.size);
}

fn decode_entry(reader: &mut ByteReader<'_>) -> Result<QueueEntryRecord> {
    Ok(QueueEntryRecord {
        queue_key: QueueKey(reader.u64()?),
        queue_seq: reader.u64()?,
        message_key: MessageKey(reader.u64()?),
        size: reader.u32()?,
    })
}

#[derive(Clone)]
pub(crate) struct QueueEntriesCodec;

impl Codec<QueueEntries> for QueueEntriesCodec {
    fn encode(&self, value: &QueueEntries) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_u32(&mut out, value.len() as u32);
        for entry in value.values() {
            encode_entry(&mut out, entry);
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<QueueEntries> {
        let mut reader = ByteReader::new(bytes);
        let count = reader.u32()?;
        let mut entries = QueueEntries::new();
        for _ in 0..count {
            let entry = decode_entry(&mut reader)?;
            entries.insert(entry.queue_seq, entry);
        }
        reader.finish()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_roundtrip() {
        let root = RootRecord {
            last_message_key: 42,
            last_queue_key: 7,
            message_index: Some(PageId(12)),
            queue_catalog: None,
        };
        let bytes = RootCodec.encode(&root).unwrap();
        assert_eq!(RootCodec.decode(&bytes).unwrap(), root);
    }

    #[test]
    fn message_index_roundtrip() {
        let mut index = MessageIndex::new();
        index.insert(
            MessageKey(3),
            StoredMessage {
                record: MessageRecord {
                    message_id: "broker:1:3".into(),
                    payload: vec![1, 2, 3],
                },
                refs: 2,
            },
        );
        index.insert(
            MessageKey(9),
            StoredMessage {
                record: MessageRecord {
                    message_id: "broker:1:9".into(),
                    payload: Vec::new(),
                },
                refs: 0,
            },
        );
        let bytes = MessageIndexCodec.encode(&index).unwrap();
        assert_eq!(MessageIndexCodec.decode(&bytes).unwrap(), index);
    }

    #[test]
    fn queue_catalog_roundtrip() {
        let mut catalog = QueueCatalog::new();
        catalog.insert(
            QueueKey(1),
            QueueInfo {
                record: QueueRecord {
                    name: "orders".into(),
                },
                entries: Some(PageId(30)),
            },
        );
        let bytes = QueueCatalogCodec.encode(&catalog).unwrap();
        assert_eq!(QueueCatalogCodec.decode(&bytes).unwrap(), catalog);
    }

    #[test]
    fn queue_entries_roundtrip() {
        let mut entries = QueueEntries::new();
        for seq in [4u64, 8, 15] {
            entries.insert(
                seq,
                QueueEntryRecord {
                    queue_key: QueueKey(1),
                    queue_seq: seq,
                    message_key: MessageKey(seq * 10),
                    size: 128,
                },
            );
        }
        let bytes = QueueEntriesCodec.encode(&entries).unwrap();
        assert_eq!(QueueEntriesCodec.decode(&bytes).unwrap(), entries);
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let root = RootRecord::default();
        let mut bytes = RootCodec.encode(&root).unwrap();
        bytes.truncate(10);
        assert!(matches!(
            RootCodec.decode(&bytes),
            Err(CombError::Corruption(_))
        ));
    }
}
