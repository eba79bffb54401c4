//! PFS0 partition filesystem containers.
//!
//! The flat archive layout used both for title packages (`.nsp`) and
//! for the filesystem inside meta archives: a header, an entry table,
//! a string table, then raw file data. Entry offsets are relative to
//! the end of the string table.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};
use thiserror::Error;
use tracing::trace;

use crate::io::{ReadAt, SharedSource, SliceRegion};

pub const PFS_MAGIC: [u8; 4] = *b"PFS0";

const HEADER_SIZE: usize = 0x10;
const ENTRY_SIZE: usize = 0x18;

#[derive(Error, Debug)]
pub enum PfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad partition magic {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("Entry {0} has a name outside the string table")]
    InvalidNameOffset(u32),

    #[error("Entry {name} extends past the container (offset {offset:#x}, size {size:#x})")]
    EntryOutOfRange { name: String, offset: u64, size: u64 },

    #[error("Header parse error: {0}")]
    Parse(#[from] binrw::Error),
}

pub type Result<T> = std::result::Result<T, PfsError>;

#[binrw]
#[brw(little, magic = b"PFS0")]
struct RawPfsHeader {
    entry_count: u32,
    string_table_size: u32,
    reserved: u32,
}

#[binrw]
#[brw(little)]
struct RawPfsEntry {
    data_offset: u64,
    size: u64,
    name_offset: u32,
    reserved: u32,
}

/// One file inside a partition.
#[derive(Debug, Clone)]
pub struct PfsEntry {
    pub name: String,
    /// Absolute byte offset within the underlying source.
    pub offset: u64,
    pub size: u64,
}

/// Parsed partition directory over a shared source.
pub struct Pfs {
    source: SharedSource,
    entries: Vec<PfsEntry>,
}

impl std::fmt::Debug for Pfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pfs")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Pfs {
    /// Parse the partition directory at the start of `source`.
    pub fn parse(source: SharedSource) -> Result<Self> {
        let mut head = [0u8; HEADER_SIZE];
        source.read_at(0, &mut head)?;
        if head[..4] != PFS_MAGIC {
            let mut magic = [0u8; 4];
            magic.copy_from_slice(&head[..4]);
            return Err(PfsError::InvalidMagic(magic));
        }

        let header = RawPfsHeader::read(&mut Cursor::new(&head[..]))?;
        let table_len =
            header.entry_count as usize * ENTRY_SIZE + header.string_table_size as usize;
        let mut table = vec![0u8; table_len];
        source.read_at(HEADER_SIZE as u64, &mut table)?;

        let strings = &table[header.entry_count as usize * ENTRY_SIZE..];
        let data_base =
            (HEADER_SIZE + header.entry_count as usize * ENTRY_SIZE) as u64
                + u64::from(header.string_table_size);

        let source_len = source.len()?;
        let mut cursor = Cursor::new(&table[..header.entry_count as usize * ENTRY_SIZE]);
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            let raw = RawPfsEntry::read(&mut cursor)?;
            let name = read_name(strings, raw.name_offset)?;
            let Some(offset) = data_base.checked_add(raw.data_offset) else {
                return Err(PfsError::EntryOutOfRange {
                    name,
                    offset: raw.data_offset,
                    size: raw.size,
                });
            };
            if offset.checked_add(raw.size).is_none_or(|end| end > source_len) {
                return Err(PfsError::EntryOutOfRange {
                    name,
                    offset,
                    size: raw.size,
                });
            }
            entries.push(PfsEntry {
                name,
                offset,
                size: raw.size,
            });
        }

        trace!(entries = entries.len(), "parsed partition directory");
        Ok(Self { source, entries })
    }

    pub fn entries(&self) -> &[PfsEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&PfsEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries whose name ends with `suffix` (case-sensitive).
    pub fn with_suffix<'a>(&'a self, suffix: &'a str) -> impl Iterator<Item = &'a PfsEntry> {
        self.entries.iter().filter(move |e| e.name.ends_with(suffix))
    }

    /// A shareable view over one entry's bytes.
    pub fn entry_source(&self, entry: &PfsEntry) -> SharedSource {
        std::sync::Arc::new(SliceRegion::new(
            self.source.clone(),
            entry.offset,
            entry.size,
        ))
    }

    /// Read an entry fully into memory. Intended for the small
    /// metadata files, not content archives.
    pub fn read_entry(&self, entry: &PfsEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.size as usize];
        self.source.read_at(entry.offset, &mut buf)?;
        Ok(buf)
    }
}

fn read_name(strings: &[u8], offset: u32) -> Result<String> {
    let start = offset as usize;
    if start >= strings.len() {
        return Err(PfsError::InvalidNameOffset(offset));
    }
    let end = strings[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or(PfsError::InvalidNameOffset(offset))?;
    Ok(String::from_utf8_lossy(&strings[start..end]).into_owned())
}

/// Builds a partition image from named files.
#[derive(Default)]
pub struct PfsBuilder {
    files: Vec<(String, Vec<u8>)>,
}

impl PfsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.files.push((name.into(), data));
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let mut string_table = Vec::new();
        let mut entries = Vec::with_capacity(self.files.len());
        let mut data_offset = 0u64;
        for (name, data) in &self.files {
            let name_offset = string_table.len() as u32;
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
            entries.push(RawPfsEntry {
                data_offset,
                size: data.len() as u64,
                name_offset,
                reserved: 0,
            });
            data_offset += data.len() as u64;
        }
        // Pad the string table so data starts 0x10-aligned.
        let table_end = HEADER_SIZE + entries.len() * ENTRY_SIZE + string_table.len();
        string_table.resize(string_table.len() + (0x10 - table_end % 0x10) % 0x10, 0);

        let mut out = Cursor::new(Vec::new());
        RawPfsHeader {
            entry_count: entries.len() as u32,
            string_table_size: string_table.len() as u32,
            reserved: 0,
        }
        .write(&mut out)?;
        for entry in &entries {
            entry.write(&mut out)?;
        }
        let mut image = out.into_inner();
        image.extend_from_slice(&string_table);
        for (_, data) in &self.files {
            image.extend_from_slice(data);
        }
        Ok(image)
    }
}
