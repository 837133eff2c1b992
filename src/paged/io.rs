#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use crate::error::{CombError, Result};

/// Positional I/O seam under the page file.
///
/// Offsets are absolute byte positions; both operations transfer the full
/// buffer or fail. Implementations must be shareable across threads.
pub trait FileIo: Send + Sync + 'static {
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
}

/// `FileIo` over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    #[cfg(unix)]
    fn pread(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(dst, off)
    }

    #[cfg(unix)]
    fn pwrite(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(src, off)
    }

    #[cfg(windows)]
    fn pread(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(dst, off)
    }

    #[cfg(windows)]
    fn pwrite(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(src, off)
    }
}

impl FileIo for StdFileIo {
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            match self.pread(off + done as u64, &mut dst[done..]) {
                Ok(0) => {
                    return Err(CombError::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "page read past end of file",
                    )))
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < src.len() {
            match self.pwrite(off + done as u64, &src[done..]) {
                Ok(0) => {
                    return Err(CombError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "page write made no progress",
                    )))
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn transfers_are_positional_and_complete() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();

        io.write_all_at(512, b"back").unwrap();
        io.write_all_at(0, b"front").unwrap();
        io.sync().unwrap();
        assert_eq!(io.len().unwrap(), 516);

        let mut front = [0u8; 5];
        let mut back = [0u8; 4];
        io.read_exact_at(0, &mut front).unwrap();
        io.read_exact_at(512, &mut back).unwrap();
        assert_eq!(&front, b"front");
        assert_eq!(&back, b"back");
    }

    #[test]
    fn short_reads_surface_as_unexpected_eof() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();
        io.write_all_at(0, b"xy").unwrap();

        let mut buf = [0u8; 8];
        match io.read_exact_at(0, &mut buf) {
            Err(CombError::Io(err)) => assert_eq!(err.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected EOF error, got {other:?}"),
        }
    }
}
