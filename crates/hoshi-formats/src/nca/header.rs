//! Archive header structures and parsing.

use std::io::Cursor;
use std::ops::Range;

use binrw::{BinRead, BinWrite, binrw};
use sha2::{Digest, Sha256};
use tracing::trace;

use super::error::{NcaError, Result};
use hoshi_crypto::keys::KeyAreaIndex;
use hoshi_crypto::{KeySet, aes};

/// Archive magic bytes.
pub const NCA_MAGIC: [u8; 4] = *b"NCA3";

/// Total header size, including all four FS headers.
pub const HEADER_SIZE: usize = 0xC00;

/// Section offsets are expressed in units of this many bytes.
pub const MEDIA_UNIT: u64 = 0x200;

/// Number of section slots in the header.
pub const SECTION_COUNT: usize = 4;

/// Size of one per-section FS header.
pub const FS_HEADER_SIZE: usize = 0x200;

/// Byte range of the decrypted header covered by both RSA signatures.
pub const SIGNED_HEADER_RANGE: Range<usize> = 0x200..0x400;

/// Distribution channel flag in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DistributionType {
    Download = 0,
    GameCard = 1,
}

/// Declared content type of one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Program = 0,
    Meta = 1,
    Control = 2,
    Manual = 3,
    Data = 4,
    PublicData = 5,
}

impl ContentType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Program),
            1 => Some(Self::Meta),
            2 => Some(Self::Control),
            3 => Some(Self::Manual),
            4 => Some(Self::Data),
            5 => Some(Self::PublicData),
            _ => None,
        }
    }
}

/// Section body encryption scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionType {
    None = 1,
    Xts = 2,
    Ctr = 3,
}

impl EncryptionType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::None),
            2 => Some(Self::Xts),
            3 => Some(Self::Ctr),
            _ => None,
        }
    }
}

/// Rights ID binding an archive to its ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RightsId(pub [u8; 16]);

impl RightsId {
    pub const ZERO: Self = Self([0; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse from the 32-hex-digit form used in ticket file names.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(Self)
    }
}

impl std::fmt::Display for RightsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSectionEntry {
    pub media_start: u32,
    pub media_end: u32,
    pub reserved: [u8; 8],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub(crate) struct RawFsHeader {
    pub version: u16,
    pub fs_type: u8,
    pub hash_type: u8,
    pub encryption_type: u8,
    pub metadata_hash_type: u8,
    pub reserved1: [u8; 2],
    pub hash_data: [u8; 0xF8],
    pub patch_info: [u8; 0x40],
    pub generation: u32,
    pub secure_value: u32,
    pub compression_info: [u8; 0x28],
    pub reserved2: [u8; 0x90],
}

impl Default for RawFsHeader {
    fn default() -> Self {
        Self {
            version: 2,
            fs_type: 0,
            hash_type: 0,
            encryption_type: EncryptionType::None as u8,
            metadata_hash_type: 0,
            reserved1: [0; 2],
            hash_data: [0; 0xF8],
            patch_info: [0; 0x40],
            generation: 0,
            secure_value: 0,
            compression_info: [0; 0x28],
            reserved2: [0; 0x90],
        }
    }
}

impl RawFsHeader {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::with_capacity(FS_HEADER_SIZE));
        self.write(&mut out)?;
        Ok(out.into_inner())
    }

    /// 8-byte CTR nonce: generation and secure value, big-endian.
    pub fn ctr_nonce(&self) -> [u8; 8] {
        ((u64::from(self.generation) << 32) | u64::from(self.secure_value)).to_be_bytes()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub(crate) struct RawNcaHeader {
    pub fixed_key_signature: [u8; 0x100],
    pub meta_signature: [u8; 0x100],
    pub magic: [u8; 4],
    pub distribution_type: u8,
    pub content_type: u8,
    pub key_generation_old: u8,
    pub key_area_index: u8,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    pub signature_key_generation: u8,
    pub reserved: [u8; 0xE],
    pub rights_id: [u8; 0x10],
    pub section_entries: [RawSectionEntry; 4],
    pub section_hashes: [[u8; 0x20]; 4],
    pub encrypted_key_area: [[u8; 0x10]; 4],
    pub reserved2: [u8; 0xC0],
    pub fs_headers: [RawFsHeader; 4],
}

impl Default for RawNcaHeader {
    fn default() -> Self {
        Self {
            fixed_key_signature: [0; 0x100],
            meta_signature: [0; 0x100],
            magic: NCA_MAGIC,
            distribution_type: DistributionType::Download as u8,
            content_type: ContentType::Data as u8,
            key_generation_old: 0,
            key_area_index: KeyAreaIndex::Application as u8,
            content_size: 0,
            program_id: 0,
            content_index: 0,
            sdk_version: 0,
            key_generation: 0,
            signature_key_generation: 0,
            reserved: [0; 0xE],
            rights_id: [0; 0x10],
            section_entries: [RawSectionEntry {
                media_start: 0,
                media_end: 0,
                reserved: [0; 8],
            }; 4],
            section_hashes: [[0; 0x20]; 4],
            encrypted_key_area: [[0; 0x10]; 4],
            reserved2: [0; 0xC0],
            fs_headers: [
                RawFsHeader::default(),
                RawFsHeader::default(),
                RawFsHeader::default(),
                RawFsHeader::default(),
            ],
        }
    }
}

/// One populated section of an archive.
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo {
    pub index: usize,
    /// Absolute byte offset of the section within the archive.
    pub offset: u64,
    /// Section length in bytes.
    pub size: u64,
    pub encryption: EncryptionType,
    /// CTR nonce for the section (unused for other schemes).
    pub nonce: [u8; 8],
    /// Whether the FS header matched its header-declared digest.
    pub fs_header_hash_ok: bool,
}

/// Parsed, decrypted archive header.
#[derive(Debug, Clone)]
pub struct NcaHeader {
    raw: RawNcaHeader,
    sections: Vec<SectionInfo>,
}

impl NcaHeader {
    /// Parse a header from its decrypted bytes.
    pub fn parse(decrypted: &[u8]) -> Result<Self> {
        if decrypted.len() < HEADER_SIZE {
            return Err(NcaError::InvalidReadSize {
                expected: HEADER_SIZE as u64,
                actual: decrypted.len() as u64,
            });
        }

        let mut cursor = Cursor::new(decrypted);
        let raw = RawNcaHeader::read(&mut cursor)?;

        if raw.magic != NCA_MAGIC {
            return Err(NcaError::InvalidMagic(raw.magic));
        }

        let mut sections = Vec::new();
        for index in 0..SECTION_COUNT {
            let entry = &raw.section_entries[index];
            if entry.media_end <= entry.media_start {
                continue;
            }
            let fs_header = &raw.fs_headers[index];
            let encryption = EncryptionType::from_byte(fs_header.encryption_type)
                .ok_or(NcaError::InvalidEncryptionType(fs_header.encryption_type))?;

            let digest = Sha256::digest(fs_header.to_bytes()?);
            let fs_header_hash_ok = digest.as_slice() == raw.section_hashes[index].as_slice();

            sections.push(SectionInfo {
                index,
                offset: u64::from(entry.media_start) * MEDIA_UNIT,
                size: u64::from(entry.media_end - entry.media_start) * MEDIA_UNIT,
                encryption,
                nonce: fs_header.ctr_nonce(),
                fs_header_hash_ok,
            });
        }

        trace!(
            sections = sections.len(),
            content_size = raw.content_size,
            "parsed archive header"
        );
        Ok(Self { raw, sections })
    }

    /// Decrypt `encrypted` with the console header key, then parse.
    pub fn parse_encrypted(encrypted: &[u8], keys: &KeySet) -> Result<Self> {
        if encrypted.len() < HEADER_SIZE {
            return Err(NcaError::InvalidReadSize {
                expected: HEADER_SIZE as u64,
                actual: encrypted.len() as u64,
            });
        }
        let mut decrypted = encrypted[..HEADER_SIZE].to_vec();
        aes::xts_decrypt(keys.header_key()?, &mut decrypted, 0)?;
        Self::parse(&decrypted)
    }

    /// Serialize the decrypted header back to its 0xC00-byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(HEADER_SIZE));
        self.raw.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Serialize and re-encrypt under the console header key.
    pub fn to_encrypted_bytes(&self, keys: &KeySet) -> Result<Vec<u8>> {
        let mut bytes = self.to_bytes()?;
        aes::xts_encrypt(keys.header_key()?, &mut bytes, 0)?;
        Ok(bytes)
    }

    /// The header bytes covered by the RSA signatures.
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_bytes()?[SIGNED_HEADER_RANGE].to_vec())
    }

    pub fn fixed_key_signature(&self) -> &[u8; 0x100] {
        &self.raw.fixed_key_signature
    }

    pub fn meta_signature(&self) -> &[u8; 0x100] {
        &self.raw.meta_signature
    }

    pub fn is_gamecard(&self) -> bool {
        self.raw.distribution_type == DistributionType::GameCard as u8
    }

    pub fn content_type(&self) -> Option<ContentType> {
        ContentType::from_byte(self.raw.content_type)
    }

    pub fn content_size(&self) -> u64 {
        self.raw.content_size
    }

    pub fn program_id(&self) -> u64 {
        self.raw.program_id
    }

    /// Effective key generation: the larger of the two header fields.
    pub fn key_generation(&self) -> u8 {
        self.raw.key_generation_old.max(self.raw.key_generation)
    }

    pub fn signature_key_generation(&self) -> u8 {
        self.raw.signature_key_generation
    }

    pub fn key_area_index(&self) -> Result<KeyAreaIndex> {
        KeyAreaIndex::from_byte(self.raw.key_area_index)
            .ok_or(NcaError::InvalidKeyAreaIndex(self.raw.key_area_index))
    }

    pub fn rights_id(&self) -> RightsId {
        RightsId(self.raw.rights_id)
    }

    pub fn encrypted_key_area(&self) -> &[[u8; 16]; 4] {
        &self.raw.encrypted_key_area
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> Result<&SectionInfo> {
        self.sections
            .iter()
            .find(|s| s.index == index)
            .ok_or(NcaError::SectionOutOfRange(index))
    }

    // Mutators used when an install converts crypto. The section
    // table never changes, so `sections` stays valid.

    pub fn clear_rights_id(&mut self) {
        self.raw.rights_id = [0; 16];
    }

    pub fn set_key_generation(&mut self, generation: u8) {
        self.raw.key_generation_old = generation.min(2);
        self.raw.key_generation = generation;
    }

    pub fn set_encrypted_key_area(&mut self, key_area: [[u8; 16]; 4]) {
        self.raw.encrypted_key_area = key_area;
    }

    pub fn set_distribution_download(&mut self) {
        self.raw.distribution_type = DistributionType::Download as u8;
    }

    pub(crate) fn raw(&self) -> &RawNcaHeader {
        &self.raw
    }

    pub(crate) fn from_raw(raw: RawNcaHeader) -> Result<Self> {
        let bytes = {
            let mut cursor = Cursor::new(Vec::with_capacity(HEADER_SIZE));
            raw.write(&mut cursor)?;
            cursor.into_inner()
        };
        Self::parse(&bytes)
    }
}
