//! Input sources for install jobs.
//!
//! A source is anything with exact random-access reads; the trait
//! itself lives in `hoshi-formats` ([`ReadAt`]) so parsers and the
//! pipeline share one contract. This module supplies the two concrete
//! sources the entry points construct, file- and memory-backed.
//! Network-backed sources implement [`ReadAt`] outside this crate.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use hoshi_formats::io::{ReadAt, SharedSource};

/// File-backed source using positional reads, safe to share across
/// the job without seeking.
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<SharedSource> {
        let file = File::open(path)?;
        debug!(path = %path.display(), size = file.metadata()?.len(), "opened source");
        Ok(Arc::new(Self { file }))
    }
}

impl ReadAt for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        ReadAt::read_at(&self.file, offset, buf)
    }

    fn len(&self) -> std::io::Result<u64> {
        ReadAt::len(&self.file)
    }
}

/// In-memory source, mainly for tests and small repackaging jobs.
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> SharedSource {
        Arc::new(Self { data })
    }
}

impl ReadAt for MemorySource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.data.read_at(offset, buf)
    }

    fn len(&self) -> std::io::Result<u64> {
        ReadAt::len(&self.data)
    }
}
