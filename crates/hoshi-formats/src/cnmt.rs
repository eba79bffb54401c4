//! Packaged content metadata.
//!
//! The `.cnmt` file inside a meta archive's partition lists every
//! content archive of a title: a fixed header, a type-specific
//! extended header, then one 0x38-byte record per content. Record
//! hashes are what ties the manifest to the archives it names.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{trace, warn};

pub const CNMT_HEADER_SIZE: usize = 0x20;
pub const CONTENT_RECORD_SIZE: usize = 0x38;

/// Offset of the required-system-version field inside the extended
/// header of application and patch manifests.
const EXT_REQUIRED_SYSTEM_VERSION: usize = 0x8;

#[derive(Error, Debug)]
pub enum CnmtError {
    #[error("Manifest is {0} bytes, shorter than its own header")]
    Truncated(usize),

    #[error("Unknown content meta type {0:#04x}")]
    UnknownMetaType(u8),

    #[error("Manifest parse error: {0}")]
    Parse(#[from] binrw::Error),
}

pub type Result<T> = std::result::Result<T, CnmtError>;

/// Kind of title a manifest describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetaType {
    Application = 0x80,
    Patch = 0x81,
    AddOnContent = 0x82,
    Delta = 0x83,
    DataPatch = 0x84,
}

impl MetaType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(Self::Application),
            0x81 => Some(Self::Patch),
            0x82 => Some(Self::AddOnContent),
            0x83 => Some(Self::Delta),
            0x84 => Some(Self::DataPatch),
            _ => None,
        }
    }

    /// Whether the extended header carries a required system version.
    fn has_required_system_version(self) -> bool {
        matches!(self, Self::Application | Self::Patch)
    }
}

/// Role of one archive within a title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentClass {
    Meta = 0,
    Program = 1,
    Data = 2,
    Control = 3,
    HtmlDocument = 4,
    LegalInformation = 5,
    DeltaFragment = 6,
}

impl ContentClass {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Meta),
            1 => Some(Self::Program),
            2 => Some(Self::Data),
            3 => Some(Self::Control),
            4 => Some(Self::HtmlDocument),
            5 => Some(Self::LegalInformation),
            6 => Some(Self::DeltaFragment),
            _ => None,
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct RawCnmtHeader {
    title_id: u64,
    version: u32,
    meta_type: u8,
    reserved1: u8,
    extended_header_size: u16,
    content_count: u16,
    content_meta_count: u16,
    attributes: u8,
    reserved2: [u8; 3],
    required_download_system_version: u32,
    reserved3: [u8; 4],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct RawContentRecord {
    hash: [u8; 0x20],
    content_id: [u8; 0x10],
    size: [u8; 6],
    content_type: u8,
    id_offset: u8,
}

/// One content archive named by a manifest.
#[derive(Debug, Clone)]
pub struct ContentRecord {
    /// SHA-256 over the archive's on-disk bytes.
    pub hash: [u8; 0x20],
    pub content_id: [u8; 0x10],
    pub size: u64,
    pub class: Option<ContentClass>,
    pub class_byte: u8,
    pub id_offset: u8,
}

impl ContentRecord {
    /// Archive file stem, e.g. `c0ffee...` in `c0ffee....nca`.
    pub fn content_id_hex(&self) -> String {
        hex::encode(self.content_id)
    }
}

/// Parsed content manifest.
#[derive(Debug, Clone)]
pub struct Cnmt {
    header: RawCnmtHeader,
    meta_type: MetaType,
    extended_header: Vec<u8>,
    records: Vec<ContentRecord>,
    /// Trailing bytes after the records (meta records, digest), kept
    /// verbatim for re-emission.
    trailer: Vec<u8>,
}

impl Cnmt {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CNMT_HEADER_SIZE {
            return Err(CnmtError::Truncated(bytes.len()));
        }
        let mut cursor = Cursor::new(bytes);
        let header = RawCnmtHeader::read(&mut cursor)?;
        let meta_type =
            MetaType::from_byte(header.meta_type).ok_or(CnmtError::UnknownMetaType(header.meta_type))?;

        let ext_end = CNMT_HEADER_SIZE + header.extended_header_size as usize;
        let records_end = ext_end + header.content_count as usize * CONTENT_RECORD_SIZE;
        if bytes.len() < records_end {
            return Err(CnmtError::Truncated(bytes.len()));
        }
        let extended_header = bytes[CNMT_HEADER_SIZE..ext_end].to_vec();

        let mut cursor = Cursor::new(&bytes[ext_end..records_end]);
        let mut records = Vec::with_capacity(header.content_count as usize);
        for _ in 0..header.content_count {
            let raw = RawContentRecord::read(&mut cursor)?;
            let mut size_bytes = [0u8; 8];
            size_bytes[..6].copy_from_slice(&raw.size);
            let class = ContentClass::from_byte(raw.content_type);
            if class.is_none() {
                warn!(content_type = raw.content_type, "unknown content class in manifest");
            }
            records.push(ContentRecord {
                hash: raw.hash,
                content_id: raw.content_id,
                size: u64::from_le_bytes(size_bytes),
                class,
                class_byte: raw.content_type,
                id_offset: raw.id_offset,
            });
        }

        trace!(
            title_id = format!("{:016x}", header.title_id),
            ?meta_type,
            contents = records.len(),
            "parsed content manifest"
        );
        Ok(Self {
            header,
            meta_type,
            extended_header,
            records,
            trailer: bytes[records_end..].to_vec(),
        })
    }

    pub fn title_id(&self) -> u64 {
        self.header.title_id
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn meta_type(&self) -> MetaType {
        self.meta_type
    }

    pub fn records(&self) -> &[ContentRecord] {
        &self.records
    }

    /// Records the installer stores, i.e. everything except delta
    /// fragments.
    pub fn installable_records(&self) -> impl Iterator<Item = &ContentRecord> {
        self.records
            .iter()
            .filter(|r| r.class != Some(ContentClass::DeltaFragment))
    }

    /// Base application this patch or add-on belongs to, from the
    /// extended header.
    pub fn application_id(&self) -> Option<u64> {
        match self.meta_type {
            MetaType::Application => Some(self.header.title_id),
            _ if self.extended_header.len() >= 8 => {
                Some(LittleEndian::read_u64(&self.extended_header[..8]))
            }
            _ => None,
        }
    }

    /// Firmware floor declared by application and patch manifests.
    pub fn required_system_version(&self) -> Option<u32> {
        if !self.meta_type.has_required_system_version() {
            return None;
        }
        self.extended_header
            .get(EXT_REQUIRED_SYSTEM_VERSION..EXT_REQUIRED_SYSTEM_VERSION + 4)
            .map(LittleEndian::read_u32)
    }

    /// Overwrite the firmware floor. No-op for manifest types without
    /// the field.
    pub fn set_required_system_version(&mut self, version: u32) {
        if !self.meta_type.has_required_system_version() {
            return;
        }
        if let Some(field) = self
            .extended_header
            .get_mut(EXT_REQUIRED_SYSTEM_VERSION..EXT_REQUIRED_SYSTEM_VERSION + 4)
        {
            LittleEndian::write_u32(field, version);
        }
    }

    /// Serialize back to the packaged layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.header.write(&mut cursor)?;
        let mut out = cursor.into_inner();
        out.extend_from_slice(&self.extended_header);
        for record in &self.records {
            let raw = RawContentRecord {
                hash: record.hash,
                content_id: record.content_id,
                size: record.size.to_le_bytes()[..6].try_into().unwrap_or([0; 6]),
                content_type: record.class_byte,
                id_offset: record.id_offset,
            };
            let mut cursor = Cursor::new(Vec::new());
            raw.write(&mut cursor)?;
            out.extend_from_slice(&cursor.into_inner());
        }
        out.extend_from_slice(&self.trailer);
        Ok(out)
    }
}

/// Fabricates manifests for tests and repackaging.
pub struct CnmtBuilder {
    title_id: u64,
    version: u32,
    meta_type: MetaType,
    application_id: u64,
    required_system_version: u32,
    records: Vec<ContentRecord>,
}

impl CnmtBuilder {
    pub fn new(title_id: u64, meta_type: MetaType) -> Self {
        Self {
            title_id,
            version: 0,
            meta_type,
            application_id: title_id,
            required_system_version: 0,
            records: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn application_id(mut self, id: u64) -> Self {
        self.application_id = id;
        self
    }

    pub fn required_system_version(mut self, version: u32) -> Self {
        self.required_system_version = version;
        self
    }

    pub fn add_content(
        mut self,
        content_id: [u8; 0x10],
        hash: [u8; 0x20],
        size: u64,
        class: ContentClass,
    ) -> Self {
        self.records.push(ContentRecord {
            hash,
            content_id,
            size,
            class: Some(class),
            class_byte: class as u8,
            id_offset: 0,
        });
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let extended_header: Vec<u8> = match self.meta_type {
            MetaType::Application => {
                // patch id, required system version, required application version
                let mut ext = vec![0u8; 0x10];
                LittleEndian::write_u64(&mut ext[..8], self.title_id ^ 0x800);
                LittleEndian::write_u32(&mut ext[8..12], self.required_system_version);
                ext
            }
            MetaType::Patch => {
                let mut ext = vec![0u8; 0x10];
                LittleEndian::write_u64(&mut ext[..8], self.application_id);
                LittleEndian::write_u32(&mut ext[8..12], self.required_system_version);
                ext
            }
            MetaType::AddOnContent => {
                // application id, required application version
                let mut ext = vec![0u8; 0x18];
                LittleEndian::write_u64(&mut ext[..8], self.application_id);
                ext
            }
            MetaType::Delta | MetaType::DataPatch => {
                let mut ext = vec![0u8; 0x10];
                LittleEndian::write_u64(&mut ext[..8], self.application_id);
                ext
            }
        };

        let header = RawCnmtHeader {
            title_id: self.title_id,
            version: self.version,
            meta_type: self.meta_type as u8,
            reserved1: 0,
            extended_header_size: extended_header.len() as u16,
            content_count: self.records.len() as u16,
            content_meta_count: 0,
            attributes: 0,
            reserved2: [0; 3],
            required_download_system_version: 0,
            reserved3: [0; 4],
        };

        let cnmt = Cnmt {
            header,
            meta_type: self.meta_type,
            extended_header,
            records: self.records,
            trailer: vec![0u8; 0x20],
        };
        cnmt.to_bytes()
    }
}
