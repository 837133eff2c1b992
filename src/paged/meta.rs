use std::collections::HashMap;
use std::ops::Range;

use crate::error::{CombError, Result};
use crate::paged::allocator::Extent;
use crate::paged::file::PageFile;
use crate::paged::snapshot::Redirect;
use crate::paged::PageId;

pub const META_MAGIC: [u8; 8] = *b"COMBDB\0\0";
pub const META_FORMAT_VERSION: u16 = 1;
/// Pages 0 and 1 hold the two meta slots; data pages start here.
pub const DATA_START: PageId = PageId(2);

const META_MAGIC_RANGE: Range<usize> = 0..8;
const META_FORMAT: Range<usize> = 8..10;
const META_RESERVED: Range<usize> = 10..12;
const META_PAGE_SIZE: Range<usize> = 12..16;
const META_SALT: Range<usize> = 16..24;
const META_COMMIT_VERSION: Range<usize> = 24..32;
const META_FREE_ROOT_PAGE: Range<usize> = 32..40;
const META_FREE_ROOT_PAGES: Range<usize> = 40..44;
const META_REDIRECT_ROOT_PAGE: Range<usize> = 44..52;
const META_REDIRECT_ROOT_PAGES: Range<usize> = 52..56;
const META_RESERVED_2: Range<usize> = 56..60;
const META_CRC32: Range<usize> = 60..64;
const META_LEN: usize = 64;

/// Location of a persisted table (free extents or redirects).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableRoot {
    pub page: PageId,
    pub pages: u32,
}

impl TableRoot {
    pub const NONE: TableRoot = TableRoot {
        page: PageId(0),
        pages: 0,
    };

    pub fn is_none(&self) -> bool {
        self.pages == 0
    }
}

/// The engine's root record: everything needed to reconstruct allocator
/// and redirect state at open.
///
/// Two slots (pages 0 and 1) are written alternately by commit-version
/// parity; recovery picks the valid slot with the higher version, so a
/// torn meta write falls back to the previous commit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Meta {
    pub page_size: u32,
    pub salt: u64,
    pub format_version: u16,
    pub commit_version: u64,
    pub free_root: TableRoot,
    pub redirect_root: TableRoot,
}

impl Meta {
    fn slot(&self) -> PageId {
        PageId(self.commit_version % 2)
    }
}

fn meta_crc(buf: &[u8], slot: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&slot.to_be_bytes());
    hasher.update(&buf[..META_CRC32.start]);
    hasher.finalize()
}

pub fn write_meta_slot(file: &PageFile, meta: &Meta) -> Result<()> {
    let mut buf = [0u8; META_LEN];
    buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
    buf[META_FORMAT].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_RESERVED].fill(0);
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_COMMIT_VERSION].copy_from_slice(&meta.commit_version.to_be_bytes());
    buf[META_FREE_ROOT_PAGE].copy_from_slice(&meta.free_root.page.0.to_be_bytes());
    buf[META_FREE_ROOT_PAGES].copy_from_slice(&meta.free_root.pages.to_be_bytes());
    buf[META_REDIRECT_ROOT_PAGE].copy_from_slice(&meta.redirect_root.page.0.to_be_bytes());
    buf[META_REDIRECT_ROOT_PAGES].copy_from_slice(&meta.redirect_root.pages.to_be_bytes());
    buf[META_RESERVED_2].fill(0);
    let slot = meta.slot();
    let crc = meta_crc(&buf, slot.0);
    buf[META_CRC32].copy_from_slice(&crc.to_be_bytes());
    file.write(slot, &buf)
}

fn decode_meta_slot(buf: &[u8], slot: u64) -> Option<Meta> {
    if buf.len() < META_LEN || buf[META_MAGIC_RANGE] != META_MAGIC {
        return None;
    }
    let crc = u32::from_be_bytes(buf[META_CRC32].try_into().ok()?);
    if crc != meta_crc(buf, slot) {
        return None;
    }
    let format_version = u16::from_be_bytes(buf[META_FORMAT].try_into().ok()?);
    if format_version != META_FORMAT_VERSION {
        return None;
    }
    let commit_version = u64::from_be_bytes(buf[META_COMMIT_VERSION].try_into().ok()?);
    if commit_version % 2 != slot {
        return None;
    }
    Some(Meta {
        page_size: u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().ok()?),
        salt: u64::from_be_bytes(buf[META_SALT].try_into().ok()?),
        format_version,
        commit_version,
        free_root: TableRoot {
            page: PageId(u64::from_be_bytes(buf[META_FREE_ROOT_PAGE].try_into().ok()?)),
            pages: u32::from_be_bytes(buf[META_FREE_ROOT_PAGES].try_into().ok()?),
        },
        redirect_root: TableRoot {
            page: PageId(u64::from_be_bytes(
                buf[META_REDIRECT_ROOT_PAGE].try_into().ok()?,
            )),
            pages: u32::from_be_bytes(buf[META_REDIRECT_ROOT_PAGES].try_into().ok()?),
        },
    })
}

/// Loads the newest valid meta slot.
pub fn load_meta(file: &PageFile) -> Result<Meta> {
    let mut best: Option<Meta> = None;
    for slot in 0..2u64 {
        let mut buf = [0u8; META_LEN];
        file.read(PageId(slot), &mut buf)?;
        if let Some(meta) = decode_meta_slot(&buf, slot) {
            if best
                .as_ref()
                .is_none_or(|b| meta.commit_version > b.commit_version)
            {
                best = Some(meta);
            }
        }
    }
    best.ok_or(CombError::Corruption("no valid meta slot"))
}

// Persisted tables are flat byte runs with a trailing salted CRC; they are
// rewritten wholesale at every commit and referenced from the meta record.

fn table_crc(salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn seal_table(mut payload: Vec<u8>, salt: u64) -> Vec<u8> {
    let crc = table_crc(salt, &payload);
    payload.extend_from_slice(&crc.to_be_bytes());
    payload
}

fn open_table(bytes: &[u8], salt: u64) -> Result<&[u8]> {
    if bytes.len() < 4 {
        return Err(CombError::Corruption("persisted table truncated"));
    }
    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
    if crc != table_crc(salt, payload) {
        return Err(CombError::Corruption("persisted table crc mismatch"));
    }
    Ok(payload)
}

pub fn encode_free_table(extents: &[Extent], salt: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + extents.len() * 16);
    payload.extend_from_slice(&(extents.len() as u32).to_be_bytes());
    for extent in extents {
        payload.extend_from_slice(&extent.start.to_be_bytes());
        payload.extend_from_slice(&extent.len.to_be_bytes());
    }
    seal_table(payload, salt)
}

pub fn decode_free_table(bytes: &[u8], salt: u64) -> Result<Vec<Extent>> {
    let payload = open_table(bytes, salt)?;
    if payload.len() < 4 {
        return Err(CombError::Corruption("free table truncated"));
    }
    let count = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
    if payload.len() < 4 + count * 16 {
        return Err(CombError::Corruption("free table truncated"));
    }
    let mut extents = Vec::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * 16;
        let start = u64::from_be_bytes(payload[off..off + 8].try_into().unwrap());
        let len = u64::from_be_bytes(payload[off + 8..off + 16].try_into().unwrap());
        extents.push(Extent::new(start, len));
    }
    Ok(extents)
}

const REDIRECT_TAG_TO: u8 = 1;
const REDIRECT_TAG_FREED: u8 = 2;

pub fn encode_redirect_table(redirects: &HashMap<PageId, Redirect>, salt: u64) -> Vec<u8> {
    let mut entries: Vec<_> = redirects.iter().collect();
    entries.sort_by_key(|(page, _)| page.0);
    let mut payload = Vec::with_capacity(4 + entries.len() * 17);
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (page, redirect) in entries {
        payload.extend_from_slice(&page.0.to_be_bytes());
        match redirect {
            Redirect::To(target) => {
                payload.push(REDIRECT_TAG_TO);
                payload.extend_from_slice(&target.0.to_be_bytes());
            }
            Redirect::Freed => {
                payload.push(REDIRECT_TAG_FREED);
                payload.extend_from_slice(&0u64.to_be_bytes());
            }
        }
    }
    seal_table(payload, salt)
}

pub fn decode_redirect_table(bytes: &[u8], salt: u64) -> Result<HashMap<PageId, Redirect>> {
    let payload = open_table(bytes, salt)?;
    if payload.len() < 4 {
        return Err(CombError::Corruption("redirect table truncated"));
    }
    let count = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
    if payload.len() < 4 + count * 17 {
        return Err(CombError::Corruption("redirect table truncated"));
    }
    let mut redirects = HashMap::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * 17;
        let page = PageId(u64::from_be_bytes(payload[off..off + 8].try_into().unwrap()));
        let tag = payload[off + 8];
        let target = u64::from_be_bytes(payload[off + 9..off + 17].try_into().unwrap());
        let redirect = match tag {
            REDIRECT_TAG_TO => Redirect::To(PageId(target)),
            REDIRECT_TAG_FREED => Redirect::Freed,
            _ => return Err(CombError::Corruption("redirect table has unknown tag")),
        };
        redirects.insert(page, redirect);
    }
    Ok(redirects)
}
