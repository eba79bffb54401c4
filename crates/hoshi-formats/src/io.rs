//! Random-access byte sources.
//!
//! The pipeline never assumes a seekable stream it can own; instead
//! everything reads through [`ReadAt`], which file, memory and
//! network-backed sources implement. Short reads are errors — a
//! parser that got fewer bytes than it asked for cannot tell a
//! truncated archive from a transport hiccup, so the contract is
//! all-or-nothing.

use std::io;
use std::sync::Arc;

/// Random access read over an immutable byte source.
pub trait ReadAt: Send + Sync {
    /// Fill `buf` from `offset`. Reading past the end is an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total length of the source in bytes.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Reference-counted source handle shared across one install job.
pub type SharedSource = Arc<dyn ReadAt>;

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset out of range"))?;
        let end = start.checked_add(buf.len()).filter(|&end| end <= self.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&self[start..end]);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of source",
            )),
        }
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.as_ref().len() as u64)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.as_slice().read_at(offset, buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.as_slice().len() as u64)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// A byte range of a larger source, used for container entries.
pub struct SliceRegion {
    source: SharedSource,
    offset: u64,
    length: u64,
}

impl SliceRegion {
    pub fn new(source: SharedSource, offset: u64, length: u64) -> Self {
        Self {
            source,
            offset,
            length,
        }
    }
}

impl ReadAt for SliceRegion {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.length) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of region",
            ));
        }
        self.source.read_at(self.offset + offset, buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.length)
    }
}

/// Sequential [`std::io::Read`] adapter over part of a [`ReadAt`]
/// source, for codecs that want a stream.
pub struct RegionReader {
    source: SharedSource,
    pos: u64,
    end: u64,
}

impl RegionReader {
    pub fn new(source: SharedSource, start: u64, end: u64) -> Self {
        Self {
            source,
            pos: start,
            end,
        }
    }
}

impl io::Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let take = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.source.read_at(self.pos, &mut buf[..take])?;
        self.pos += take as u64;
        Ok(take)
    }
}
