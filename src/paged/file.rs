use std::path::Path;

use crate::error::{CombError, Result};
use crate::paged::io::{FileIo, StdFileIo};
use crate::paged::PageId;

/// Access mode for a page-aligned byte window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SliceMode {
    Read,
    ReadWrite,
    Write,
}

impl SliceMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, SliceMode::Read)
    }
}

/// A page-aligned byte window over one or more contiguous pages.
///
/// Writable slices buffer their content; [`PageFile::unslice`] writes it
/// back and must be called on every exit path.
#[derive(Debug)]
pub struct Slice {
    mode: SliceMode,
    first_page: PageId,
    data: Vec<u8>,
}

impl Slice {
    pub fn mode(&self) -> SliceMode {
        self.mode
    }

    pub fn first_page(&self) -> PageId {
        self.first_page
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Raw fixed-size page storage over positional file I/O.
///
/// Pages are identified by a non-negative index; reads past the current
/// end of file observe zeroes, and writes extend the file as needed.
#[derive(Clone)]
pub struct PageFile {
    io: StdFileIo,
    page_size: u32,
}

impl PageFile {
    pub fn open(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        if page_size < 64 {
            return Err(CombError::Invalid("page size too small"));
        }
        Ok(Self {
            io: StdFileIo::open(path)?,
            page_size,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of pages needed to hold `byte_len` bytes.
    pub fn pages(&self, byte_len: usize) -> u32 {
        let ps = self.page_size as usize;
        (byte_len.div_ceil(ps)) as u32
    }

    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.io.len()? == 0)
    }

    fn offset(&self, page: PageId) -> u64 {
        page.0 * self.page_size as u64
    }

    /// Reads up to one page worth of bytes starting at `page`.
    pub fn read(&self, page: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.page_size as usize {
            return Err(CombError::Invalid("read buffer larger than a page"));
        }
        self.read_at_page(self.offset(page), buf)
    }

    /// Writes up to one page worth of bytes starting at `page`.
    pub fn write(&self, page: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() > self.page_size as usize {
            return Err(CombError::Invalid("write buffer larger than a page"));
        }
        self.io.write_all_at(self.offset(page), buf)
    }

    /// Reads `count` contiguous pages into an owned buffer.
    pub fn read_extent(&self, page: PageId, count: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size as usize * count as usize];
        self.read_at_page(self.offset(page), &mut buf)?;
        Ok(buf)
    }

    /// Writes a contiguous byte run starting at `page`.
    pub fn write_extent(&self, page: PageId, bytes: &[u8]) -> Result<()> {
        self.io.write_all_at(self.offset(page), bytes)
    }

    pub fn slice(&self, mode: SliceMode, page: PageId, count: u32) -> Result<Slice> {
        if count == 0 {
            return Err(CombError::Invalid("slice of zero pages"));
        }
        let data = match mode {
            SliceMode::Write => vec![0u8; self.page_size as usize * count as usize],
            SliceMode::Read | SliceMode::ReadWrite => self.read_extent(page, count)?,
        };
        Ok(Slice {
            mode,
            first_page: page,
            data,
        })
    }

    /// Read-only byte window over individually addressed pages, for
    /// ranges whose physical locations are not contiguous.
    pub(crate) fn gather(&self, pages: &[PageId]) -> Result<Slice> {
        let Some(first) = pages.first() else {
            return Err(CombError::Invalid("slice of zero pages"));
        };
        let page_size = self.page_size as usize;
        let mut data = vec![0u8; page_size * pages.len()];
        for (chunk, page) in data.chunks_mut(page_size).zip(pages) {
            self.read(*page, chunk)?;
        }
        Ok(Slice {
            mode: SliceMode::Read,
            first_page: *first,
            data,
        })
    }

    /// Releases a slice, writing buffered content back for writable modes.
    pub fn unslice(&self, slice: Slice) -> Result<()> {
        if slice.mode.is_writable() {
            self.write_extent(slice.first_page, &slice.data)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    fn read_at_page(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let file_len = self.io.len()?;
        let want = buf.len() as u64;
        if off >= file_len {
            buf.fill(0);
            return Ok(());
        }
        let avail = (file_len - off).min(want) as usize;
        self.io.read_exact_at(off, &mut buf[..avail])?;
        buf[avail..].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_file(page_size: u32) -> (tempfile::TempDir, PageFile) {
        let dir = tempdir().unwrap();
        let file = PageFile::open(dir.path().join("pages.db"), page_size).unwrap();
        (dir, file)
    }

    #[test]
    fn page_roundtrip() {
        let (_dir, file) = open_file(256);
        file.write(PageId(3), b"hello pages").unwrap();
        let mut buf = [0u8; 11];
        file.read(PageId(3), &mut buf).unwrap();
        assert_eq!(&buf, b"hello pages");
    }

    #[test]
    fn unwritten_pages_read_as_zeroes() {
        let (_dir, file) = open_file(256);
        let mut buf = [0xffu8; 16];
        file.read(PageId(9), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn pages_rounds_up() {
        let (_dir, file) = open_file(256);
        assert_eq!(file.pages(0), 0);
        assert_eq!(file.pages(1), 1);
        assert_eq!(file.pages(256), 1);
        assert_eq!(file.pages(257), 2);
    }

    #[test]
    fn writable_slice_persists_on_unslice() {
        let (_dir, file) = open_file(128);
        let mut slice = file.slice(SliceMode::Write, PageId(2), 2).unwrap();
        slice.data_mut()[..4].copy_from_slice(b"abcd");
        slice.data_mut()[128..132].copy_from_slice(b"wxyz");
        file.unslice(slice).unwrap();

        let mut buf = [0u8; 4];
        file.read(PageId(2), &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        file.read(PageId(3), &mut buf).unwrap();
        assert_eq!(&buf, b"wxyz");
    }

    #[test]
    fn read_write_slice_sees_existing_content() {
        let (_dir, file) = open_file(128);
        file.write(PageId(5), b"seed").unwrap();
        let slice = file.slice(SliceMode::ReadWrite, PageId(5), 1).unwrap();
        assert_eq!(&slice.data()[..4], b"seed");
        file.unslice(slice).unwrap();
    }
}
