//! Installed-title records.
//!
//! The executor asks the database whether a title is already present
//! (a partial content set counts as not installed) and commits one
//! record per successful title. [`MemoryTitleDb`] keeps records in
//! memory and can load/save a small snapshot format, which is where
//! the corrupt-header and corrupt-records error kinds come from.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::{InstallError, Result};
use hoshi_formats::cnmt::MetaType;

/// How much of a title the database already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    NotInstalled,
    /// Some required archives present, some missing. Treated as not
    /// installed by the skip check.
    Partial,
    Installed,
}

/// One committed title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRecord {
    pub title_id: u64,
    pub version: u32,
    pub meta_type: MetaType,
    pub content_ids: Vec<[u8; 16]>,
    /// Whether written archives passed the full trust chain.
    pub verified: bool,
}

/// Store of installed titles.
pub trait TitleDb {
    /// State of `title_id` with respect to `required` content IDs.
    fn state(&self, title_id: u64, required: &[[u8; 16]]) -> Result<InstallState>;

    /// Version of the installed record, if any.
    fn installed_version(&self, title_id: u64) -> Option<u32>;

    /// Commit one title atomically. Called only after every archive
    /// of the title is in final storage.
    fn commit(&mut self, record: TitleRecord) -> Result<()>;
}

const SNAPSHOT_MAGIC: [u8; 4] = *b"HSDB";
const SNAPSHOT_VERSION: u32 = 1;

/// In-memory database with a flat snapshot format.
#[derive(Debug, Default)]
pub struct MemoryTitleDb {
    titles: HashMap<u64, TitleRecord>,
}

impl MemoryTitleDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> impl Iterator<Item = &TitleRecord> {
        self.titles.values()
    }

    /// Parse a snapshot produced by [`to_snapshot`](Self::to_snapshot).
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 || bytes[..4] != SNAPSHOT_MAGIC {
            return Err(InstallError::DbCorruptHeader);
        }
        if LittleEndian::read_u32(&bytes[4..8]) != SNAPSHOT_VERSION {
            return Err(InstallError::DbCorruptHeader);
        }
        let count = LittleEndian::read_u32(&bytes[8..12]) as usize;

        let mut titles = HashMap::with_capacity(count);
        let mut offset = 12;
        for _ in 0..count {
            // title id, version, meta type, verified, content count
            if bytes.len() < offset + 16 {
                return Err(InstallError::DbCorruptInfos);
            }
            let title_id = LittleEndian::read_u64(&bytes[offset..]);
            let version = LittleEndian::read_u32(&bytes[offset + 8..]);
            let meta_type = MetaType::from_byte(bytes[offset + 12])
                .ok_or(InstallError::DbCorruptInfos)?;
            let verified = bytes[offset + 13] != 0;
            let content_count = LittleEndian::read_u16(&bytes[offset + 14..]) as usize;
            offset += 16;

            if bytes.len() < offset + content_count * 16 {
                return Err(InstallError::DbCorruptInfos);
            }
            let mut content_ids = Vec::with_capacity(content_count);
            for _ in 0..content_count {
                let mut id = [0u8; 16];
                id.copy_from_slice(&bytes[offset..offset + 16]);
                content_ids.push(id);
                offset += 16;
            }

            titles.insert(
                title_id,
                TitleRecord {
                    title_id,
                    version,
                    meta_type,
                    content_ids,
                    verified,
                },
            );
        }
        debug!(titles = titles.len(), "loaded title database snapshot");
        Ok(Self { titles })
    }

    pub fn to_snapshot(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.titles.len() as u32).to_le_bytes());
        for record in self.titles.values() {
            out.extend_from_slice(&record.title_id.to_le_bytes());
            out.extend_from_slice(&record.version.to_le_bytes());
            out.push(record.meta_type as u8);
            out.push(u8::from(record.verified));
            out.extend_from_slice(&(record.content_ids.len() as u16).to_le_bytes());
            for id in &record.content_ids {
                out.extend_from_slice(id);
            }
        }
        out
    }
}

impl TitleDb for MemoryTitleDb {
    fn state(&self, title_id: u64, required: &[[u8; 16]]) -> Result<InstallState> {
        let Some(record) = self.titles.get(&title_id) else {
            return Ok(InstallState::NotInstalled);
        };
        let present = required
            .iter()
            .filter(|id| record.content_ids.contains(id))
            .count();
        Ok(if present == required.len() {
            InstallState::Installed
        } else if present == 0 {
            InstallState::NotInstalled
        } else {
            warn!(
                title_id = format!("{title_id:016x}"),
                present,
                required = required.len(),
                "title has a partial content set"
            );
            InstallState::Partial
        })
    }

    fn installed_version(&self, title_id: u64) -> Option<u32> {
        self.titles.get(&title_id).map(|r| r.version)
    }

    fn commit(&mut self, record: TitleRecord) -> Result<()> {
        debug!(
            title_id = format!("{:016x}", record.title_id),
            version = record.version,
            contents = record.content_ids.len(),
            "committed title"
        );
        self.titles.insert(record.title_id, record);
        Ok(())
    }
}
